use std::time::Duration;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Docker engine and per-container configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Daemon URL (`unix://...` or `tcp://...`). `None` uses local defaults.
    pub docker_host: Option<String>,
    /// Image every user container runs.
    pub image: String,
    /// Container name prefix; names are `<prefix>-<record_id>`.
    pub container_prefix: String,
    /// Upper bound for any single daemon call.
    pub timeout_secs: u64,
    /// Grace period given to nginx on stop before it is killed.
    pub stop_grace_secs: u64,
    /// First host port handed out (inclusive).
    pub port_range_start: u16,
    /// End of the host port range (exclusive).
    pub port_range_end: u16,
    /// Host name used when building container URLs.
    pub public_host: String,
    /// Start containers right after creating them.
    pub auto_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            image: "nginx:alpine".to_string(),
            container_prefix: "dockyard".to_string(),
            timeout_secs: 10,
            stop_grace_secs: 10,
            port_range_start: 8000,
            port_range_end: 8999,
            public_host: "localhost".to_string(),
            auto_start: true,
        }
    }
}

impl EngineConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            docker_host: optional_env("DOCKER_HOST")?,
            image: parse_string_env("NGINX_IMAGE", defaults.image)?,
            container_prefix: parse_string_env("CONTAINER_PREFIX", defaults.container_prefix)?,
            timeout_secs: parse_optional_env("ENGINE_TIMEOUT_SECS", defaults.timeout_secs)?,
            stop_grace_secs: parse_optional_env("STOP_GRACE_SECS", defaults.stop_grace_secs)?,
            port_range_start: parse_optional_env("PORT_RANGE_START", defaults.port_range_start)?,
            port_range_end: parse_optional_env("PORT_RANGE_END", defaults.port_range_end)?,
            public_host: parse_string_env("PUBLIC_HOST", defaults.public_host)?,
            auto_start: parse_bool_env("AUTO_START", defaults.auto_start)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start >= self.port_range_end {
            return Err(ConfigError::InvalidValue {
                key: "PORT_RANGE_START".to_string(),
                message: format!(
                    "port range {}..{} is empty",
                    self.port_range_start, self.port_range_end
                ),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ENGINE_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let prefix_ok = !self.container_prefix.is_empty()
            && self
                .container_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !prefix_ok {
            return Err(ConfigError::InvalidValue {
                key: "CONTAINER_PREFIX".to_string(),
                message: format!("'{}' is not a valid container name prefix", self.container_prefix),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn port_range(&self) -> std::ops::Range<u16> {
        self.port_range_start..self.port_range_end
    }
}
