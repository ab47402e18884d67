//! Configuration for dockyard.
//!
//! Settings are loaded with priority: env var > `.env` file > default.
//! `./.env` is read via dotenvy early in startup and never overrides
//! variables already present in the environment.

mod engine;
pub(crate) mod helpers;
mod reconciler;
mod server;
mod storage;

use crate::error::ConfigError;

pub use self::engine::EngineConfig;
pub use self::reconciler::ReconcilerConfig;
pub use self::server::{ServerConfig, StatusConfig};
pub use self::storage::{StateBackend, StorageConfig};

/// Main configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub reconciler: ReconcilerConfig,
    pub status: StatusConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from environment variables (and `./.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::build()
    }

    fn build() -> Result<Self, ConfigError> {
        Ok(Self {
            engine: EngineConfig::resolve()?,
            storage: StorageConfig::resolve()?,
            reconciler: ReconcilerConfig::resolve()?,
            status: StatusConfig::resolve()?,
            server: ServerConfig::resolve()?,
        })
    }
}
