//! Daemon configuration
//!
//! ```toml
//! store_path = "swift-store.json"
//! directory_path = "directory.toml"
//! log_level = "debug"
//!
//! [engine]
//! blocked_site_window_secs = 300
//!
//! # Tabs already focused when the daemon starts
//! [[open_tabs]]
//! tab_id = 1
//! url = "https://example.com/"
//! ```

use fos_swift::{EngineConfig, EngineConfigError, FocusedTab};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

fn default_store_path() -> PathBuf {
    PathBuf::from("swift-store.json")
}

fn default_directory_path() -> PathBuf {
    PathBuf::from("directory.toml")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid [engine] table: {0}")]
    Engine(#[from] EngineConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwiftdConfig {
    /// JSON document holding rules, flags and engine records
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Server directory, `.toml` or `.json`
    #[serde(default = "default_directory_path")]
    pub directory_path: PathBuf,
    /// Used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub open_tabs: Vec<FocusedTab>,
}

impl Default for SwiftdConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            directory_path: default_directory_path(),
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            open_tabs: Vec::new(),
        }
    }
}

impl SwiftdConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` when given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}
