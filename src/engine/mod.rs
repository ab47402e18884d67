//! Container engine adapter.
//!
//! The only way the rest of the crate talks to the daemon. Implementations
//! are stateless façades: they hold a connection handle and a timeout, never
//! record state. A timed-out call reports [`EngineError::Timeout`] and the
//! caller must treat the outcome as unknown.
//!
//! ```text
//! Orchestrator ──┐
//!                ├──► Arc<dyn ContainerEngine> ──► DockerEngine ──► dockerd
//! Reconciler ────┤                              └─► FakeEngine (tests)
//! StatusReporter ┘
//! ```

mod docker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::record::OwnerId;

pub use docker::{DockerEngine, connect_docker};

/// Label marking containers managed by dockyard.
pub const LABEL_MANAGED_BY: &str = "dockyard.managed_by";
/// Value of [`LABEL_MANAGED_BY`].
pub const MANAGED_BY_VALUE: &str = "dockyard";
/// Label carrying the owning user's id.
pub const LABEL_OWNER_ID: &str = "dockyard.owner_id";
/// Label carrying the container record id.
pub const LABEL_RECORD_ID: &str = "dockyard.record_id";
/// Label carrying the record's display name (used when adopting orphans).
pub const LABEL_DISPLAY_NAME: &str = "dockyard.display_name";
/// Label carrying the published host port (used when adopting orphans).
pub const LABEL_HOST_PORT: &str = "dockyard.host_port";

/// Directory nginx serves from inside the container.
pub const NGINX_HTML_DIR: &str = "/usr/share/nginx/html";

/// Normalized daemon-side container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Running,
    Exited,
    Unknown,
}

impl EngineStatus {
    /// Normalize a Docker state string (`running`, `exited`, `created`, ...).
    pub fn from_docker_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" | "restarting" => Self::Running,
            "exited" | "created" | "dead" | "paused" => Self::Exited,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Everything the daemon needs to create one user container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Deterministic per record, so a retried create collides instead of duplicating.
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// Host directory mounted read-only at [`NGINX_HTML_DIR`].
    pub html_dir: PathBuf,
    pub host_port: u16,
}

impl ContainerSpec {
    /// Build the spec for a record, labeling it for reconciliation.
    pub fn for_record(
        prefix: &str,
        image: &str,
        record_id: Uuid,
        owner: &OwnerId,
        display_name: &str,
        html_dir: PathBuf,
        host_port: u16,
    ) -> Self {
        let labels = HashMap::from([
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
            (LABEL_OWNER_ID.to_string(), owner.to_string()),
            (LABEL_RECORD_ID.to_string(), record_id.to_string()),
            (LABEL_DISPLAY_NAME.to_string(), display_name.to_string()),
            (LABEL_HOST_PORT.to_string(), host_port.to_string()),
        ]);
        Self {
            name: container_name(prefix, record_id),
            image: image.to_string(),
            labels,
            html_dir,
            host_port,
        }
    }
}

/// Container name for a record.
pub fn container_name(prefix: &str, record_id: Uuid) -> String {
    format!("{}-{}", prefix, record_id)
}

/// Label filter for `list_by_label`, `key=value` pairs that must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub matches: Vec<(String, String)>,
}

impl LabelSelector {
    /// Every container managed by dockyard.
    pub fn managed() -> Self {
        Self::default().with(LABEL_MANAGED_BY, MANAGED_BY_VALUE)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matches.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.matches
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Docker `label` filter values.
    pub fn to_filters(&self) -> Vec<String> {
        self.matches
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// A daemon-visible container and its labels, as reported by a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub status: EngineStatus,
}

impl LabeledContainer {
    pub fn record_id(&self) -> Option<Uuid> {
        self.labels
            .get(LABEL_RECORD_ID)
            .and_then(|v| Uuid::parse_str(v).ok())
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        self.labels
            .get(LABEL_OWNER_ID)
            .filter(|v| !v.is_empty())
            .map(OwnerId::new)
    }

    pub fn host_port(&self) -> Option<u16> {
        self.labels.get(LABEL_HOST_PORT).and_then(|v| v.parse().ok())
    }
}

/// Control API of the container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check the daemon is reachable.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Create (but do not start) a container; returns the engine-assigned id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, container_id: &str) -> Result<(), EngineError>;

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), EngineError>;

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), EngineError>;

    async fn inspect(&self, container_id: &str) -> Result<EngineStatus, EngineError>;

    async fn list_by_label(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<LabeledContainer>, EngineError>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String, EngineError>;
}
