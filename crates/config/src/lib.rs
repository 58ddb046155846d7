//! Configuration loading and hot-reloading for vkgate.
//!
//! Uses figment for YAML + environment configuration with sensible defaults,
//! and notify + arc-swap for live file watching.

pub mod schema;
pub mod watcher;

pub use schema::{
    CipherConfig, Config, DatabaseConfig, ENV_PREFIX, KeyServiceConfig, KeysConfig, LogConfig,
    LogFormat, ProvisionerConfig, RouterConfig,
};
pub use watcher::ConfigWatcher;
