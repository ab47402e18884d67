use std::time::Duration;

use crate::config::helpers::{parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;
use crate::reconciler::OrphanPolicy;

/// Reconciler scheduling and policy.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Whether the background reconciliation loop runs.
    pub enabled: bool,
    /// Seconds between periodic sweeps.
    pub interval_secs: u64,
    /// Maximum records repaired concurrently within one sweep.
    pub concurrency: usize,
    /// What to do with managed containers that have no live record.
    pub orphan_policy: OrphanPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            concurrency: 8,
            orphan_policy: OrphanPolicy::Adopt,
        }
    }
}

impl ReconcilerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let policy = parse_string_env("ORPHAN_POLICY", defaults.orphan_policy.to_string())?;
        let orphan_policy = policy.parse().map_err(|e: String| ConfigError::InvalidValue {
            key: "ORPHAN_POLICY".to_string(),
            message: e,
        })?;
        let concurrency: usize = parse_optional_env("RECONCILE_CONCURRENCY", defaults.concurrency)?;
        let interval_secs: u64 = parse_optional_env("RECONCILE_INTERVAL_SECS", defaults.interval_secs)?;
        if concurrency == 0 || interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: if concurrency == 0 {
                    "RECONCILE_CONCURRENCY".to_string()
                } else {
                    "RECONCILE_INTERVAL_SECS".to_string()
                },
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            enabled: parse_bool_env("RECONCILE_ENABLED", defaults.enabled)?,
            interval_secs,
            concurrency,
            orphan_policy,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
