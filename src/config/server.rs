use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// HTTP API listener.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl ServerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_string_env("API_HOST", defaults.host)?,
            port: parse_optional_env("API_PORT", defaults.port)?,
        })
    }

    pub fn bind_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                key: "API_HOST".to_string(),
                message: e.to_string(),
            })
    }
}

/// Status read path.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// How long an inspected status may be reused before asking the daemon again.
    pub max_age_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { max_age_secs: 5 }
    }
}

impl StatusConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            max_age_secs: parse_optional_env("STATUS_MAX_AGE_SECS", Self::default().max_age_secs)?,
        })
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_addr() {
        let addr = ServerConfig::default().bind_addr().unwrap();
        assert_eq!(addr.port(), 5000);
    }

    #[test]
    fn invalid_host_is_a_config_error() {
        let config = ServerConfig {
            host: "not a host".to_string(),
            port: 1,
        };
        assert!(config.bind_addr().is_err());
    }
}
