//! Typed configuration for the benchd service.
//!
//! Loaded from a TOML file; every section has serde defaults so a partial
//! file (or none at all, in tests) yields a usable configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub backends: BackendsConfig,
    pub resources: ResourcesConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Tracing filter level for the benchd target, e.g. "info" or "debug".
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub qemu: BackendConfig,
    pub renode: BackendConfig,
    pub openocd: BackendConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub enabled: bool,
    /// Path to the backend binary; resolved through PATH when bare.
    pub binary: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Hard cap on concurrently live sessions.
    pub max_sessions: usize,
    /// Idle timeout after which a session may be reaped, in seconds.
    pub session_timeout_secs: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base path under which programs/, snapshots/ and coverage/ live.
    pub base_path: PathBuf,
    pub max_program_size_mb: u64,
    pub max_snapshot_size_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data"),
            max_program_size_mb: 256,
            max_snapshot_size_mb: 1024,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
