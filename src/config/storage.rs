//! Configuration Storage
//!
//! The daemon reads one optional JSON file at startup. A missing file means
//! defaults. Relative paths inside it are resolved against the file's own
//! directory, and `~/` against the home directory, so a config can sit next
//! to the topology it points at.

use std::path::{Path, PathBuf};

use tokio::fs;

use super::types::{PortalConfig, CONFIG_VERSION};

/// Environment variable overriding the config file path
pub const CONFIG_PATH_ENV: &str = "KURTOSIS_PORTAL_CONFIG";

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Cannot locate the home directory, set KURTOSIS_PORTAL_CONFIG instead")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// `~/.kurtosis-portal`
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".kurtosis-portal"))
        .ok_or(StorageError::NoConfigDir)
}

/// `$KURTOSIS_PORTAL_CONFIG` if set, else `config.json` in `config_dir()`
pub fn config_file() -> Result<PathBuf, StorageError> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(config_dir()?.join(CONFIG_FILE_NAME)),
    }
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the path `config_file()` picks
    pub fn locate() -> Result<Self, StorageError> {
        Ok(Self::with_path(config_file()?))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config, falling back to defaults when there is none
    ///
    /// A file that does not parse is renamed out of the way so the next start
    /// does not trip over it again. A file written by a newer portal is an
    /// error rather than silently half-understood.
    pub async fn load(&self) -> Result<PortalConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", self.path);
                return Ok(PortalConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut config = match serde_json::from_str::<PortalConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {:?}: {}", self.path, e);
                match self.set_aside().await {
                    Ok(moved) => tracing::warn!("Moved it to {:?}, starting with defaults", moved),
                    Err(e) => tracing::error!("Could not move {:?} aside: {}", self.path, e),
                }
                return Ok(PortalConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        config.topology_file = config.topology_file.take().map(|path| self.resolve(path));
        Ok(config)
    }

    /// Resolve a path written inside the config file
    fn resolve(&self, path: PathBuf) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("~") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        match self.path.parent() {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }

    /// Rename the file to `<name>.broken.<timestamp>`
    async fn set_aside(&self) -> Result<PathBuf, StorageError> {
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(
            ".broken.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        let aside = PathBuf::from(aside);
        fs::rename(&self.path, &aside).await?;
        Ok(aside)
    }
}
