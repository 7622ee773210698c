/// log4rs setup driven by the engine's logging config
///
use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;
use std::str::FromStr;

use crate::config::LoggingConfig;

/// build the log4rs config: a console appender and, optionally, a file appender
pub fn build_config(config: &LoggingConfig) -> Result<Config> {
    let level = LevelFilter::from_str(&config.level)
        .map_err(|_| anyhow!("invalid log level: {}", config.level))?;

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&config.pattern)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
    let mut root = Root::builder().appender("stdout");

    if let Some(path) = &config.file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&config.pattern)))
            .build(path)
            .with_context(|| format!("cannot open log file {}", path))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    let config = builder
        .build(root.build(level))
        .context("invalid logging configuration")?;

    Ok(config)
}

/// install the global logger; call once at process start
pub fn init_logging(config: &LoggingConfig) -> Result<Handle> {
    let handle = log4rs::init_config(build_config(config)?)?;
    log::info!("logging initialized at level {}", config.level);
    Ok(handle)
}
