//! Configuration Management Module
//!
//! Daemon settings and their persistent storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError, CONFIG_PATH_ENV};
pub use types::{
    PortalConfig, RelayMode, RelaySettings, CONFIG_VERSION, DEFAULT_CONTROL_PORT,
};
