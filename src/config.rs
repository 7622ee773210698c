/// engine configuration: defaults, then a toml file, then `STATIC_DATA_` environment variables
///
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use log::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::registry::{SettingDescriptor, SettingRegistry};

pub const ENV_PREFIX: &str = "STATIC_DATA_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// sleep between timer loop iterations
    pub tick_ms: u64,
    /// minimum time between two full reloads
    pub reload_interval_ms: u64,
    /// budget of a queued reload task when the setting has no timeout of its own
    pub task_timeout_ms: u64,
    /// random delay added before the first full reload
    pub start_jitter_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_ms: 1_000,
            reload_interval_ms: 300_000,
            task_timeout_ms: 30_000,
            start_jitter_ms: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// prefix of every distributed-tier key
    pub namespace: String,
    pub default_ttl_secs: u64,
    /// the aggregate settings bundle, kept longer than ordinary settings
    pub bundle_key: String,
    pub bundle_ttl_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            namespace: String::from("static-data"),
            default_ttl_secs: 300,
            bundle_key: String::from("Settings"),
            bundle_ttl_secs: 3_600,
            sweep_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig { capacity: 1_024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// bound on every adapter call, single or batched
    pub timeout_ms: u64,
    /// pack rows of a batching upstream that share dependency keys into one call
    pub batch_upstream: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            timeout_ms: 30_000,
            batch_upstream: true,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub pattern: String,
    /// also append to this file when set
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: String::from("info"),
            pattern: String::from("{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l})} {T} {t} - {m}{n}"),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// object-store key prefix, `{version}/{setting}.json`
    pub version: String,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub fetch: FetchConfig,
    pub logging: LoggingConfig,
    pub settings: Vec<SettingDescriptor>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            version: String::from("v1"),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            fetch: FetchConfig::default(),
            logging: LoggingConfig::default(),
            settings: vec![],
        }
    }
}

impl EngineConfig {
    /// validate the setting rows into a registry
    pub fn registry(&self) -> Result<SettingRegistry> {
        SettingRegistry::new(self.settings.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        ConfigLoader::new()
    }
}

impl ConfigLoader {
    pub fn new() -> ConfigLoader {
        ConfigLoader {
            config_path: None,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_string();
        self
    }

    fn base(&self) -> Figment {
        Figment::new().merge(Serialized::defaults(EngineConfig::default()))
    }

    fn env(&self) -> Env {
        Env::prefixed(&self.env_prefix).split("__")
    }

    /// defaults, then the toml file when present, then the environment
    pub fn load(&self) -> Result<EngineConfig> {
        let mut figment = self.base();

        if let Some(path) = &self.config_path {
            if path.exists() {
                info!("loading static data config from {}", path.display());
                figment = figment.merge(Toml::file(path));
            } else {
                warn!("config file {} not found, using defaults", path.display());
            }
        }

        let config: EngineConfig = figment.merge(self.env()).extract()?;
        info!(
            "static data config loaded: version {}, {} settings",
            config.version,
            config.settings.len()
        );

        Ok(config)
    }

    /// like `load`, reading the toml from a string
    pub fn load_str(&self, toml: &str) -> Result<EngineConfig> {
        let config = self
            .base()
            .merge(Toml::string(toml))
            .merge(self.env())
            .extract()?;
        Ok(config)
    }
}
