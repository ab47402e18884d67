//! Read-only status views for the dashboard.
//!
//! Never writes to the index: live daemon status is cached here and drift
//! is left to the reconciler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{ContainerEngine, EngineStatus};
use crate::error::{EngineError, OrchestratorError};
use crate::index::OwnershipIndex;
use crate::reconciler::ReconcileTrigger;
use crate::record::{ContainerRecord, LifecycleState, OwnerId};

/// Cache entries older than this are dropped even as a fallback.
const CACHE_RETENTION: Duration = Duration::from_secs(600);

/// The parts of a record dashboard clients see. Host paths and reconcile
/// bookkeeping stay internal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSummary {
    pub record_id: Uuid,
    pub owner_id: OwnerId,
    pub engine_container_id: Option<String>,
    pub display_name: String,
    pub host_port: u16,
    pub lifecycle_state: LifecycleState,
    pub last_known_engine_status: Option<EngineStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ContainerRecord> for RecordSummary {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            record_id: record.record_id,
            owner_id: record.owner_id.clone(),
            engine_container_id: record.engine_container_id.clone(),
            display_name: record.display_name.clone(),
            host_port: record.host_port,
            lifecycle_state: record.lifecycle_state,
            last_known_engine_status: record.last_known_engine_status,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// A record plus what the daemon currently says about it.
#[derive(Debug, Clone)]
pub struct ContainerStatusView {
    pub record: ContainerRecord,
    /// Daemon status, fresh or from the cache. `None` when there is no container.
    pub live_status: Option<EngineStatus>,
    /// The daemon could not be asked; `live_status` is the last known value.
    pub stale: bool,
    pub url: String,
}

impl Serialize for ContainerStatusView {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(flatten)]
            record: RecordSummary,
            live_status: Option<EngineStatus>,
            stale: bool,
            url: &'a str,
        }

        Wire {
            record: RecordSummary::from(&self.record),
            live_status: self.live_status,
            stale: self.stale,
            url: &self.url,
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedStatus {
    status: EngineStatus,
    at: Instant,
    /// Wall-clock time of the inspect, compared against record commits.
    observed_at: DateTime<Utc>,
}

pub struct StatusReporter {
    engine: Arc<dyn ContainerEngine>,
    index: Arc<OwnershipIndex>,
    public_host: String,
    max_age: Duration,
    trigger: ReconcileTrigger,
    cache: Mutex<HashMap<String, CachedStatus>>,
}

impl StatusReporter {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        index: Arc<OwnershipIndex>,
        engine_config: &EngineConfig,
        max_age: Duration,
        trigger: ReconcileTrigger,
    ) -> Self {
        Self {
            engine,
            index,
            public_host: engine_config.public_host.clone(),
            max_age,
            trigger,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The owner's live (non-deleted) containers, oldest first.
    pub async fn list(&self, owner: &OwnerId) -> Result<Vec<ContainerStatusView>, OrchestratorError> {
        let records = self.index.list_by_owner(owner).await?;
        self.cache
            .lock()
            .await
            .retain(|_, entry| entry.at.elapsed() < CACHE_RETENTION);

        let mut views = Vec::with_capacity(records.len());
        for record in records.into_iter().filter(|r| !r.is_deleted()) {
            views.push(self.view(record).await);
        }
        Ok(views)
    }

    pub async fn get(&self, owner: &OwnerId, record_id: Uuid) -> Result<ContainerStatusView, OrchestratorError> {
        let record = self.index.get(record_id, owner).await?;
        Ok(self.view(record).await)
    }

    /// Last `tail` lines of the container's output.
    pub async fn logs(&self, owner: &OwnerId, record_id: Uuid, tail: usize) -> Result<String, OrchestratorError> {
        let record = self.index.get(record_id, owner).await?;
        let Some(engine_id) = record.engine_container_id else {
            return Err(OrchestratorError::InvalidTransition {
                record_id,
                state: record.lifecycle_state,
                action: "read logs of",
            });
        };
        self.engine.logs(&engine_id, tail).await.map_err(|e| match e {
            EngineError::NotFound { .. } => {
                self.trigger.request();
                OrchestratorError::NotFound { record_id }
            }
            other => OrchestratorError::EngineUnavailable {
                reason: other.to_string(),
            },
        })
    }

    async fn view(&self, record: ContainerRecord) -> ContainerStatusView {
        let url = format!("http://{}:{}", self.public_host, record.host_port);
        let Some(engine_id) = record.engine_container_id.clone() else {
            return ContainerStatusView {
                record,
                live_status: None,
                stale: false,
                url,
            };
        };

        // A commit after the inspect (a stop, a start, a repair) outdates it.
        let cached = self
            .cache
            .lock()
            .await
            .get(&engine_id)
            .copied()
            .filter(|entry| entry.observed_at >= record.updated_at);
        if let Some(entry) = cached
            && entry.at.elapsed() < self.max_age
        {
            return ContainerStatusView {
                record,
                live_status: Some(entry.status),
                stale: false,
                url,
            };
        }

        match self.engine.inspect(&engine_id).await {
            Ok(status) => {
                self.cache.lock().await.insert(
                    engine_id,
                    CachedStatus {
                        status,
                        at: Instant::now(),
                        observed_at: Utc::now(),
                    },
                );
                ContainerStatusView {
                    record,
                    live_status: Some(status),
                    stale: false,
                    url,
                }
            }
            Err(e) => {
                tracing::debug!(record_id = %record.record_id, error = %e, "Inspect failed, serving last known status");
                if matches!(e, EngineError::NotFound { .. }) {
                    self.cache.lock().await.remove(&engine_id);
                    self.trigger.request();
                }
                let live_status = cached
                    .map(|entry| entry.status)
                    .or(record.last_known_engine_status);
                ContainerStatusView {
                    record,
                    live_status,
                    stale: true,
                    url,
                }
            }
        }
    }
}
