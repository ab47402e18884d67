use std::path::PathBuf;

use crate::config::helpers::{optional_env, parse_string_env};
use crate::error::ConfigError;

/// Where container records are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    /// JSON snapshot under the dockyard home directory.
    File,
    /// Process memory only (records vanish on restart).
    Memory,
}

impl std::str::FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(StateBackend::File),
            "memory" => Ok(StateBackend::Memory),
            _ => Err(format!("Unknown state backend: {}", s)),
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory (default `~/.dockyard`).
    pub home: PathBuf,
    pub backend: StateBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            backend: StateBackend::File,
        }
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dockyard")
}

impl StorageConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend = parse_string_env("STATE_BACKEND", "file")?
            .parse()
            .map_err(|e: String| ConfigError::InvalidValue {
                key: "STATE_BACKEND".to_string(),
                message: e,
            })?;
        Ok(Self {
            home: optional_env("DOCKYARD_HOME")?
                .map(PathBuf::from)
                .unwrap_or_else(default_home),
            backend,
        })
    }

    /// Snapshot file for [`crate::index::JsonFileRecordStore`].
    pub fn state_file(&self) -> PathBuf {
        self.home.join("records.json")
    }

    /// Root of the per-record page directories.
    pub fn payload_root(&self) -> PathBuf {
        self.home.join("pages")
    }
}
