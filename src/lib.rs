#![doc = include_str!("../README.md")]

pub mod cache;
pub mod cancel;
pub mod collection;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use crate::cancel::CancelToken;
pub use crate::collection::{EntryCollection, ReloadOutcome};
pub use crate::config::{ConfigLoader, EngineConfig};
pub use crate::engine::{EngineStatus, StaticDataEngine};
pub use crate::entry::{Entry, StaticValue};
pub use crate::error::{Result, StaticDataError};
pub use crate::registry::{ProviderFilter, ProviderKind, ResourceType, SettingDescriptor, SettingRegistry};

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
