/// error taxonomy for static data resolution, caching and reload scheduling
///
use std::time::Duration;
use thiserror::Error;

use crate::registry::{ProviderKind, ResourceType};

pub type Result<T> = std::result::Result<T, StaticDataError>;

#[derive(Debug, Error)]
pub enum StaticDataError {
    /// the adapter call failed, timed out or panicked
    #[error("provider {provider} unavailable for {setting}: {message}")]
    ProviderUnavailable {
        setting: String,
        provider: ProviderKind,
        message: String,
    },

    /// the adapter succeeded but the payload was absent or empty
    #[error("provider returned no usable payload for {setting}")]
    EmptyResult { setting: String },

    #[error("payload for {setting} is not a valid {resource_type}: {source}")]
    Deserialization {
        setting: String,
        resource_type: ResourceType,
        #[source]
        source: serde_json::Error,
    },

    #[error("{setting} depends on {target} which has no resolved value")]
    DependencyUnresolved { setting: String, target: String },

    #[error("reload task for {key} exceeded its budget of {timeout:?}")]
    QueueTimeout { key: String, timeout: Duration },

    #[error("provider {provider} does not support {setting}: {message}")]
    Unsupported {
        setting: String,
        provider: ProviderKind,
        message: String,
    },

    #[error("reload queue is full ({capacity} tasks pending)")]
    QueueFull { capacity: usize },

    #[error("operation cancelled")]
    Cancelled,

    /// a full reload aborted; the previous entries stay visible
    #[error("reload failed: {0}")]
    ReloadFailed(String),

    #[error("cache tier error: {0}")]
    Cache(String),

    #[error("invalid setting registry: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown setting: {0}")]
    UnknownSetting(String),

    #[error("entry already exists: {0}")]
    DuplicateEntry(String),
}

impl From<figment::Error> for StaticDataError {
    fn from(err: figment::Error) -> Self {
        StaticDataError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_setting() {
        let err = StaticDataError::ProviderUnavailable {
            setting: "Hotels".to_string(),
            provider: ProviderKind::Pms,
            message: "503".to_string(),
        };
        assert_eq!(err.to_string(), "provider pms unavailable for Hotels: 503");

        let err = StaticDataError::QueueFull { capacity: 4 };
        assert_eq!(err.to_string(), "reload queue is full (4 tasks pending)");
    }
}
