//! Session configuration, stored as `config.json` in the robohub home

use std::path::{Path, PathBuf};
use std::time::Duration;

use robohub_proto::ProtocolVersion;

use crate::reconnect::ReconnectPolicy;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// UUID scheme the hub firmware speaks
    pub protocol: ProtocolVersion,
    /// Name or address fragment of the hub to select; any hub when unset
    pub device: Option<String>,
    /// Reconnect attempts after an unexpected link loss
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Open the GATT link as soon as a device is selected
    pub connect_on_select: bool,
    /// Bytes per script upload write
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::default(),
            device: None,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            connect_on_select: true,
            chunk_size: 180,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl SessionConfig {
    /// Read `path`, or write the defaults there if it does not exist yet
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if path.exists() {
            let data = std::fs::read_to_string(path).map_err(io)?;
            return serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            });
        }

        let config = Self::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let data = serde_json::to_string_pretty(&config).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, data).map_err(io)?;
        tracing::info!(path = %path.display(), "wrote default config");
        Ok(config)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"protocol":"legacy"}"#).unwrap();
        assert_eq!(config.protocol, ProtocolVersion::Legacy);
        assert_eq!(config.max_retries, 3);
        assert!(config.connect_on_select);
    }

    #[test]
    fn load_or_init_writes_defaults() {
        let dir = std::env::temp_dir().join(format!("robohub-config-{}", std::process::id()));
        let path = dir.join("config.json");
        let _ = std::fs::remove_file(&path);

        let written = SessionConfig::load_or_init(&path).unwrap();
        assert_eq!(written, SessionConfig::default());
        assert!(path.exists());

        std::fs::write(&path, r#"{"max_retries":5}"#).unwrap();
        let loaded = SessionConfig::load_or_init(&path).unwrap();
        assert_eq!(loaded.max_retries, 5);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(SessionConfig::load_or_init(&path), Err(ConfigError::Parse { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
