//! Application configuration.
//!
//! One JSON document, camelCase keys, every field optional:
//!
//! ```json
//! {
//!   "transfer": { "workers": 4, "maxAttempts": 5 },
//!   "pool": { "maxSessionsPerProfile": 2 },
//!   "sync": { "toleranceSecs": 2 },
//!   "logging": { "level": "debug", "json": false },
//!   "eventCapacity": 1024
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use xfer_sync::SyncConfig;
use xfer_transfer::{PoolConfig, TransferConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// `EnvFilter` directive used when neither `XFER_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_level")]
    pub level: String,
    /// One JSON object per line instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LogConfig,
    /// Events buffered per subscriber before the slowest one starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// SSH known-hosts file; defaults to one under the user config dir.
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            pool: PoolConfig::default(),
            sync: SyncConfig::default(),
            logging: LogConfig::default(),
            event_capacity: default_event_capacity(),
            known_hosts_path: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Missing file means defaults; a malformed file is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `$XDG_CONFIG_HOME/xfer/config.json` or the platform equivalent.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("xfer")
            .join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.event_capacity, 1024);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"transfer":{"workers":6},"sync":{"toleranceSecs":5},"logging":{"json":true}}"#,
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.transfer.workers, 6);
        assert_eq!(cfg.transfer.max_attempts, 5);
        assert_eq!(cfg.sync.tolerance_secs, 5);
        assert!(cfg.logging.json);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.pool.max_sessions_per_profile, 2);
    }

    #[test]
    fn test_missing_file_defaults_but_bad_json_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(AppConfig::load_or_default(&missing).unwrap(), AppConfig::default());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            AppConfig::load_or_default(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_default_path_ends_with_app_dir() {
        assert!(AppConfig::default_path().ends_with("xfer/config.json"));
    }
}
