//! Container lifecycle orchestration for user-owned records.
//!
//! Every transition follows the same shape, inside the record's exclusive
//! section: read the current record, validate the transition, call the
//! engine, then commit the outcome. When the engine call's outcome is
//! unknown (timeout) the record keeps its pre-call state, gains a
//! pending-reconcile marker, and the reconciler is woken to re-derive the
//! truth from live daemon state.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{ContainerEngine, ContainerSpec, EngineStatus, container_name};
use crate::error::{EngineError, OrchestratorError};
use crate::index::{OwnershipIndex, RecordGuard};
use crate::orchestrator::ports::PortAllocator;
use crate::payload::{MAX_PAYLOAD_BYTES, PageContext, PayloadStore, render_page};
use crate::reconciler::ReconcileTrigger;
use crate::record::{ContainerRecord, LifecycleState, OwnerId, PendingAction};

/// Suggested wait before retrying after resource exhaustion.
pub const RETRY_AFTER: Duration = Duration::from_secs(30);

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// A user's request for a new container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRequest {
    /// Defaults to `<owner>-nginx-<n>`.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Page content: a full HTML document, or text placed in the default page.
    #[serde(default)]
    pub html: Option<String>,
}

/// Result of an accepted request.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The transition completed and is committed.
    Committed(ContainerRecord),
    /// The daemon's answer is not known yet; the reconciler will finish it.
    Pending(ContainerRecord),
}

impl Outcome {
    pub fn record(&self) -> &ContainerRecord {
        match self {
            Outcome::Committed(r) | Outcome::Pending(r) => r,
        }
    }

    pub fn into_record(self) -> ContainerRecord {
        match self {
            Outcome::Committed(r) | Outcome::Pending(r) => r,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }
}

/// Daemon spec for a record (also used by the reconciler to retry creates).
pub(crate) fn spec_for(config: &EngineConfig, record: &ContainerRecord) -> ContainerSpec {
    ContainerSpec::for_record(
        &config.container_prefix,
        &config.image,
        record.record_id,
        &record.owner_id,
        &record.display_name,
        record.html_payload_ref.clone(),
        record.host_port,
    )
}

/// Drives container records through their lifecycle.
pub struct LifecycleOrchestrator {
    config: EngineConfig,
    engine: Arc<dyn ContainerEngine>,
    index: Arc<OwnershipIndex>,
    payloads: PayloadStore,
    ports: PortAllocator,
    trigger: ReconcileTrigger,
    /// Serializes name-conflict checks, port picks and inserts of new records.
    admission: Mutex<()>,
}

impl LifecycleOrchestrator {
    pub fn new(
        config: EngineConfig,
        engine: Arc<dyn ContainerEngine>,
        index: Arc<OwnershipIndex>,
        payloads: PayloadStore,
        trigger: ReconcileTrigger,
    ) -> Self {
        let ports = PortAllocator::new(config.port_range());
        Self {
            config,
            engine,
            index,
            payloads,
            ports,
            trigger,
            admission: Mutex::new(()),
        }
    }

    /// Create a new container for `owner`.
    ///
    /// Returns `Pending` when the daemon was unreachable or did not answer in
    /// time; the record stays `PENDING` and the reconciler completes it.
    pub async fn request_create(
        &self,
        owner: &OwnerId,
        request: CreateRequest,
    ) -> Result<Outcome, OrchestratorError> {
        if let Some(html) = &request.html
            && html.len() > MAX_PAYLOAD_BYTES
        {
            return Err(OrchestratorError::SpecInvalid {
                reason: format!("page content exceeds {} bytes", MAX_PAYLOAD_BYTES),
            });
        }

        let record_id = Uuid::new_v4();
        // Nobody else knows this id yet, so this never waits.
        let guard = self.index.lock(record_id).await;
        let mut record = self.admit(owner, record_id, request.display_name).await?;

        tracing::info!(
            record_id = %record_id,
            owner = %owner,
            port = record.host_port,
            "Accepted container create request"
        );

        let name = container_name(&self.config.container_prefix, record_id);
        let page = render_page(
            &PageContext {
                owner,
                display_name: &record.display_name,
                container_name: &name,
                host_port: record.host_port,
            },
            request.html.as_deref(),
        );
        if let Err(e) = self.payloads.write(record_id, &page).await {
            tracing::error!(record_id = %record_id, error = %e, "Failed to write page payload");
            record.pending_reconcile = None;
            record.transition(LifecycleState::Failed);
            self.index.commit(&guard, &record).await?;
            return Err(OrchestratorError::Storage(format!(
                "failed to write page for {}: {}",
                record_id, e
            )));
        }

        match self.engine.create(&spec_for(&self.config, &record)).await {
            Ok(engine_id) => {
                record.engine_container_id = Some(engine_id);
                record.pending_reconcile = None;
                record.last_known_engine_status = Some(EngineStatus::Exited);
                record.transition(LifecycleState::Created);
                self.commit_or_reconcile(&guard, &record).await?;
                tracing::info!(
                    record_id = %record_id,
                    engine_id = ?record.engine_container_id,
                    "Created container"
                );
            }
            Err(EngineError::SpecInvalid { reason }) => {
                record.pending_reconcile = None;
                record.transition(LifecycleState::Failed);
                self.index.commit(&guard, &record).await?;
                tracing::warn!(record_id = %record_id, reason = %reason, "Container spec rejected");
                return Err(OrchestratorError::SpecInvalid { reason });
            }
            Err(EngineError::ResourceExhausted { reason }) => {
                record.pending_reconcile = Some(PendingAction::Cleanup);
                record.transition(LifecycleState::Failed);
                self.index.commit(&guard, &record).await?;
                tracing::warn!(record_id = %record_id, reason = %reason, "Engine out of resources");
                return Err(OrchestratorError::ResourceExhausted {
                    reason,
                    retry_after: RETRY_AFTER,
                });
            }
            Err(e) => {
                // Unavailable, timeout, or a name collision with an earlier
                // attempt: the record keeps its create marker.
                tracing::warn!(
                    record_id = %record_id,
                    error = %e,
                    "Container create outcome unknown, deferring to reconciler"
                );
                self.trigger.request();
                return Ok(Outcome::Pending(record));
            }
        }

        if self.config.auto_start {
            match self.start_locked(&guard, record.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    tracing::warn!(record_id = %record_id, error = %e, "Auto-start after create failed");
                    let latest = self.index.get(record_id, owner).await?;
                    return Ok(if latest.pending_reconcile.is_some() {
                        Outcome::Pending(latest)
                    } else {
                        Outcome::Committed(latest)
                    });
                }
            }
        }

        Ok(Outcome::Committed(record))
    }

    /// Validate the request against the owner's records, pick a port and
    /// insert the `PENDING` record.
    async fn admit(
        &self,
        owner: &OwnerId,
        record_id: Uuid,
        display_name: Option<String>,
    ) -> Result<ContainerRecord, OrchestratorError> {
        let _admission = self.admission.lock().await;

        let all = self.index.list_all().await?;
        let live_for_owner: Vec<&ContainerRecord> = all
            .iter()
            .filter(|r| r.is_owned_by(owner) && !r.is_deleted())
            .collect();

        let display_name = match display_name.map(|n| n.trim().to_string()) {
            Some(name) => validate_display_name(&name)?,
            None => next_default_name(owner, &live_for_owner),
        };

        if live_for_owner.iter().any(|r| r.display_name == display_name) {
            return Err(OrchestratorError::Conflict {
                reason: format!("a container named '{}' already exists", display_name),
            });
        }

        let port = self
            .ports
            .pick(&all)
            .ok_or_else(|| OrchestratorError::ResourceExhausted {
                reason: "no free host ports".to_string(),
                retry_after: RETRY_AFTER,
            })?;

        let mut record = ContainerRecord::pending(
            record_id,
            owner.clone(),
            display_name,
            self.payloads.dir_for(record_id),
            port,
        );
        // Set before the daemon is contacted so a crash mid-create is recovered.
        record.pending_reconcile = Some(PendingAction::Create);
        self.index.insert(&record).await?;
        Ok(record)
    }

    /// Start a `CREATED` or `STOPPED` container.
    pub async fn request_start(
        &self,
        owner: &OwnerId,
        record_id: Uuid,
    ) -> Result<Outcome, OrchestratorError> {
        let guard = self.index.lock(record_id).await;
        let record = self.index.get(record_id, owner).await?;
        self.start_locked(&guard, record).await
    }

    async fn start_locked(
        &self,
        guard: &RecordGuard,
        mut record: ContainerRecord,
    ) -> Result<Outcome, OrchestratorError> {
        let record_id = record.record_id;
        refuse_if_deleting(&record)?;
        let engine_id = match (&record.engine_container_id, record.lifecycle_state.can_start()) {
            (Some(id), true) => id.clone(),
            _ => {
                return Err(OrchestratorError::InvalidTransition {
                    record_id,
                    state: record.lifecycle_state,
                    action: "start",
                });
            }
        };

        match self.engine.start(&engine_id).await {
            Ok(()) => {
                record.pending_reconcile = None;
                record.last_known_engine_status = Some(EngineStatus::Running);
                record.transition(LifecycleState::Running);
                self.index.commit(guard, &record).await?;
                tracing::info!(record_id = %record_id, "Started container");
                Ok(Outcome::Committed(record))
            }
            Err(e) => self.engine_failure(guard, record, PendingAction::Start, e).await,
        }
    }

    /// Stop a `RUNNING` container.
    pub async fn request_stop(
        &self,
        owner: &OwnerId,
        record_id: Uuid,
    ) -> Result<Outcome, OrchestratorError> {
        let guard = self.index.lock(record_id).await;
        let mut record = self.index.get(record_id, owner).await?;
        refuse_if_deleting(&record)?;

        let engine_id = match (&record.engine_container_id, record.lifecycle_state.can_stop()) {
            (Some(id), true) => id.clone(),
            _ => {
                return Err(OrchestratorError::InvalidTransition {
                    record_id,
                    state: record.lifecycle_state,
                    action: "stop",
                });
            }
        };

        match self.engine.stop(&engine_id, self.config.stop_grace()).await {
            Ok(()) => {
                record.pending_reconcile = None;
                record.last_known_engine_status = Some(EngineStatus::Exited);
                record.transition(LifecycleState::Stopped);
                self.index.commit(&guard, &record).await?;
                tracing::info!(record_id = %record_id, "Stopped container");
                Ok(Outcome::Committed(record))
            }
            Err(e) => self.engine_failure(&guard, record, PendingAction::Stop, e).await,
        }
    }

    /// Tear down the container and mark the record `DELETED`.
    ///
    /// Idempotent: deleting a deleted record returns it unchanged.
    pub async fn request_delete(
        &self,
        owner: &OwnerId,
        record_id: Uuid,
    ) -> Result<Outcome, OrchestratorError> {
        let guard = self.index.lock(record_id).await;
        let mut record = self.index.get(record_id, owner).await?;

        if record.is_deleted() {
            return Ok(Outcome::Committed(record));
        }

        if let Some(engine_id) = record.engine_container_id.clone() {
            match self.engine.remove(&engine_id, true).await {
                Ok(()) | Err(EngineError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(
                        record_id = %record_id,
                        error = %e,
                        "Container removal not confirmed, deferring to reconciler"
                    );
                    record.pending_reconcile = Some(PendingAction::Delete);
                    record.touch();
                    self.index.commit(&guard, &record).await?;
                    self.trigger.request();
                    return Ok(Outcome::Pending(record));
                }
            }
        } else if record.lifecycle_state == LifecycleState::Pending {
            // A create may still land; its container will be labeled with a
            // deleted record and removed by the reconciler.
            self.trigger.request();
        }

        if let Err(e) = self.payloads.remove(&record.html_payload_ref).await {
            tracing::warn!(record_id = %record_id, error = %e, "Failed to remove page payload");
        }

        record.transition(LifecycleState::Deleted);
        self.index.commit(&guard, &record).await?;
        tracing::info!(record_id = %record_id, owner = %owner, "Deleted container");
        Ok(Outcome::Committed(record))
    }

    /// Shared handling of a failed start/stop call.
    async fn engine_failure(
        &self,
        guard: &RecordGuard,
        mut record: ContainerRecord,
        action: PendingAction,
        err: EngineError,
    ) -> Result<Outcome, OrchestratorError> {
        let record_id = record.record_id;
        match err {
            EngineError::NotFound { .. } => {
                tracing::warn!(record_id = %record_id, action = %action, "Container vanished from the daemon");
                record.engine_container_id = None;
                record.last_known_engine_status = None;
                record.pending_reconcile = Some(PendingAction::Cleanup);
                record.transition(LifecycleState::Failed);
                self.index.commit(guard, &record).await?;
                self.trigger.request();
                Err(OrchestratorError::ContainerLost { record_id })
            }
            EngineError::Timeout { .. } => {
                tracing::warn!(record_id = %record_id, action = %action, error = %err, "Outcome unknown, deferring to reconciler");
                record.pending_reconcile = Some(action);
                record.touch();
                self.index.commit(guard, &record).await?;
                self.trigger.request();
                Err(OrchestratorError::EngineUnavailable {
                    reason: err.to_string(),
                })
            }
            EngineError::ResourceExhausted { reason } => Err(OrchestratorError::ResourceExhausted {
                reason,
                retry_after: RETRY_AFTER,
            }),
            EngineError::SpecInvalid { reason } => {
                tracing::warn!(record_id = %record_id, action = %action, reason = %reason, "Daemon rejected container");
                record.pending_reconcile = Some(PendingAction::Cleanup);
                record.transition(LifecycleState::Failed);
                self.index.commit(guard, &record).await?;
                Err(OrchestratorError::SpecInvalid { reason })
            }
            EngineError::Unavailable { .. } | EngineError::Conflict { .. } => {
                tracing::warn!(record_id = %record_id, action = %action, error = %err, "Engine unavailable");
                Err(OrchestratorError::EngineUnavailable {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Commit a freshly created container. If the index refuses the engine
    /// id, leave the container to the reconciler as an orphan.
    async fn commit_or_reconcile(
        &self,
        guard: &RecordGuard,
        record: &ContainerRecord,
    ) -> Result<(), OrchestratorError> {
        if let Err(e) = self.index.commit(guard, record).await {
            tracing::error!(record_id = %record.record_id, error = %e, "Failed to commit created container");
            self.trigger.request();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Public URL of a record's page.
    pub fn url_for(&self, record: &ContainerRecord) -> String {
        format!("http://{}:{}", self.config.public_host, record.host_port)
    }
}

/// An accepted delete owns the record until the reconciler finishes it.
fn refuse_if_deleting(record: &ContainerRecord) -> Result<(), OrchestratorError> {
    if record.pending_reconcile == Some(PendingAction::Delete) {
        return Err(OrchestratorError::Conflict {
            reason: format!("container {} is being deleted", record.record_id),
        });
    }
    Ok(())
}

fn validate_display_name(name: &str) -> Result<String, OrchestratorError> {
    if name.is_empty() {
        return Err(OrchestratorError::SpecInvalid {
            reason: "display name must not be empty".to_string(),
        });
    }
    if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(OrchestratorError::SpecInvalid {
            reason: format!("display name exceeds {} characters", MAX_DISPLAY_NAME_CHARS),
        });
    }
    if name.chars().any(char::is_control) {
        return Err(OrchestratorError::SpecInvalid {
            reason: "display name contains control characters".to_string(),
        });
    }
    Ok(name.to_string())
}

fn next_default_name(owner: &OwnerId, live: &[&ContainerRecord]) -> String {
    (live.len() + 1..)
        .map(|n| format!("{}-nginx-{}", owner, n))
        .find(|candidate| live.iter().all(|r| &r.display_name != candidate))
        .unwrap_or_else(|| format!("{}-nginx", owner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryRecordStore;
    use crate::testing::{FakeEngine, FakeOp, Fault};

    struct Harness {
        engine: Arc<FakeEngine>,
        index: Arc<OwnershipIndex>,
        orchestrator: LifecycleOrchestrator,
        _pages: tempfile::TempDir,
    }

    async fn harness(config: EngineConfig) -> Harness {
        let pages = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let index = Arc::new(
            OwnershipIndex::load(Arc::new(InMemoryRecordStore::new()))
                .await
                .unwrap(),
        );
        let orchestrator = LifecycleOrchestrator::new(
            config,
            engine.clone(),
            index.clone(),
            PayloadStore::new(pages.path()),
            ReconcileTrigger::new(),
        );
        Harness {
            engine,
            index,
            orchestrator,
            _pages: pages,
        }
    }

    fn manual_start() -> EngineConfig {
        EngineConfig {
            auto_start: false,
            ..Default::default()
        }
    }

    fn hello(name: &str) -> CreateRequest {
        CreateRequest {
            display_name: Some(name.to_string()),
            html: Some("Hello A".to_string()),
        }
    }

    #[tokio::test]
    async fn create_then_start() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");

        let created = h
            .orchestrator
            .request_create(&alice, hello("Hello A"))
            .await
            .unwrap();
        assert!(!created.is_pending());
        let record = created.into_record();
        assert_eq!(record.lifecycle_state, LifecycleState::Created);
        assert!(record.engine_container_id.is_some());
        assert!(record.pending_reconcile.is_none());
        assert!(record.html_payload_ref.join("index.html").exists());

        let started = h
            .orchestrator
            .request_start(&alice, record.record_id)
            .await
            .unwrap()
            .into_record();
        assert_eq!(started.lifecycle_state, LifecycleState::Running);
        let engine_id = started.engine_container_id.unwrap();
        assert_eq!(h.engine.container(&engine_id).unwrap().status, EngineStatus::Running);
    }

    #[tokio::test]
    async fn auto_start_runs_the_container() {
        let h = harness(EngineConfig::default()).await;
        let record = h
            .orchestrator
            .request_create(&OwnerId::new("alice"), CreateRequest::default())
            .await
            .unwrap()
            .into_record();
        assert_eq!(record.lifecycle_state, LifecycleState::Running);
        assert_eq!(record.display_name, "alice-nginx-1");
        assert_eq!(record.host_port, 8000);
    }

    #[tokio::test]
    async fn stop_on_pending_is_invalid() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        h.engine.inject(FakeOp::Create, Fault::Unavailable);
        let pending = h
            .orchestrator
            .request_create(&alice, hello("p"))
            .await
            .unwrap();
        assert!(pending.is_pending());
        assert_eq!(pending.record().lifecycle_state, LifecycleState::Pending);
        assert_eq!(pending.record().pending_reconcile, Some(PendingAction::Create));

        let err = h
            .orchestrator
            .request_stop(&alice, pending.record().record_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                state: LifecycleState::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn start_on_vanished_container_fails_the_record() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        let record = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap()
            .into_record();
        h.engine.vanish(record.engine_container_id.as_deref().unwrap());

        let err = h
            .orchestrator
            .request_start(&alice, record.record_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ContainerLost { .. }));

        let failed = h.index.get(record.record_id, &alice).await.unwrap();
        assert_eq!(failed.lifecycle_state, LifecycleState::Failed);
        assert!(failed.engine_container_id.is_none());
    }

    #[tokio::test]
    async fn spec_invalid_fails_the_record() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        h.engine.inject(FakeOp::Create, Fault::SpecInvalid);
        let err = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SpecInvalid { .. }));
        let records = h.index.list_by_owner(&alice).await.unwrap();
        assert_eq!(records[0].lifecycle_state, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn unavailable_start_leaves_state_unchanged() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        let record = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap()
            .into_record();
        h.engine.inject(FakeOp::Start, Fault::Unavailable);
        let err = h
            .orchestrator
            .request_start(&alice, record.record_id)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let after = h.index.get(record.record_id, &alice).await.unwrap();
        assert_eq!(after.lifecycle_state, LifecycleState::Created);
        assert!(after.pending_reconcile.is_none());
    }

    #[tokio::test]
    async fn timed_out_start_is_marked_for_reconcile() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        let record = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap()
            .into_record();
        h.engine.inject(FakeOp::Start, Fault::TimeoutAfterEffect);
        assert!(
            h.orchestrator
                .request_start(&alice, record.record_id)
                .await
                .is_err()
        );
        let after = h.index.get(record.record_id, &alice).await.unwrap();
        assert_eq!(after.lifecycle_state, LifecycleState::Created);
        assert_eq!(after.pending_reconcile, Some(PendingAction::Start));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let h = harness(EngineConfig::default()).await;
        let alice = OwnerId::new("alice");
        let record = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap()
            .into_record();

        let first = h
            .orchestrator
            .request_delete(&alice, record.record_id)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .request_delete(&alice, record.record_id)
            .await
            .unwrap();
        for outcome in [first, second] {
            assert!(!outcome.is_pending());
            assert_eq!(outcome.record().lifecycle_state, LifecycleState::Deleted);
            assert!(outcome.record().engine_container_id.is_none());
        }
        assert_eq!(h.engine.count(), 0);
        assert!(!record.html_payload_ref.exists());
    }

    #[tokio::test]
    async fn delete_of_already_removed_container_succeeds() {
        let h = harness(EngineConfig::default()).await;
        let alice = OwnerId::new("alice");
        let record = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap()
            .into_record();
        h.engine.vanish(record.engine_container_id.as_deref().unwrap());
        let outcome = h
            .orchestrator
            .request_delete(&alice, record.record_id)
            .await
            .unwrap();
        assert_eq!(outcome.record().lifecycle_state, LifecycleState::Deleted);
    }

    #[tokio::test]
    async fn unavailable_delete_is_accepted_pending() {
        let h = harness(EngineConfig::default()).await;
        let alice = OwnerId::new("alice");
        let record = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap()
            .into_record();
        h.engine.inject(FakeOp::Remove, Fault::Unavailable);
        let outcome = h
            .orchestrator
            .request_delete(&alice, record.record_id)
            .await
            .unwrap();
        assert!(outcome.is_pending());
        assert_eq!(outcome.record().lifecycle_state, LifecycleState::Running);
        assert_eq!(outcome.record().pending_reconcile, Some(PendingAction::Delete));
    }

    #[tokio::test]
    async fn pending_delete_blocks_start_and_stop() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        let record = h
            .orchestrator
            .request_create(&alice, hello("x"))
            .await
            .unwrap()
            .into_record();
        h.engine.inject(FakeOp::Remove, Fault::Unavailable);
        assert!(
            h.orchestrator
                .request_delete(&alice, record.record_id)
                .await
                .unwrap()
                .is_pending()
        );

        for result in [
            h.orchestrator.request_start(&alice, record.record_id).await,
            h.orchestrator.request_stop(&alice, record.record_id).await,
        ] {
            assert!(matches!(result, Err(OrchestratorError::Conflict { .. })));
        }
        let after = h.index.get(record.record_id, &alice).await.unwrap();
        assert_eq!(after.lifecycle_state, LifecycleState::Created);
        assert_eq!(after.pending_reconcile, Some(PendingAction::Delete));
        assert_eq!(h.engine.calls(FakeOp::Start), 0);
    }

    #[tokio::test]
    async fn other_owners_see_not_found() {
        let h = harness(EngineConfig::default()).await;
        let record = h
            .orchestrator
            .request_create(&OwnerId::new("alice"), hello("x"))
            .await
            .unwrap()
            .into_record();
        let mallory = OwnerId::new("mallory");
        for result in [
            h.orchestrator.request_stop(&mallory, record.record_id).await,
            h.orchestrator.request_start(&mallory, record.record_id).await,
            h.orchestrator.request_delete(&mallory, record.record_id).await,
        ] {
            assert!(matches!(result, Err(OrchestratorError::NotFound { .. })));
        }
        assert_eq!(h.engine.count(), 1);
    }

    #[tokio::test]
    async fn duplicate_names_conflict_per_owner() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        h.orchestrator
            .request_create(&alice, hello("blog"))
            .await
            .unwrap();
        assert!(matches!(
            h.orchestrator.request_create(&alice, hello("blog")).await,
            Err(OrchestratorError::Conflict { .. })
        ));
        // Another owner may reuse the name.
        h.orchestrator
            .request_create(&OwnerId::new("bob"), hello("blog"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn port_range_exhaustion() {
        let h = harness(EngineConfig {
            auto_start: false,
            port_range_start: 9000,
            port_range_end: 9001,
            ..Default::default()
        })
        .await;
        let alice = OwnerId::new("alice");
        h.orchestrator
            .request_create(&alice, hello("one"))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .request_create(&alice, hello("two"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn rejects_invalid_display_names() {
        let h = harness(manual_start()).await;
        let alice = OwnerId::new("alice");
        let long = "x".repeat(MAX_DISPLAY_NAME_CHARS + 1);
        for name in ["   ", "bad\nname", long.as_str()] {
            assert!(matches!(
                h.orchestrator.request_create(&alice, hello(name)).await,
                Err(OrchestratorError::SpecInvalid { .. })
            ));
        }
        assert_eq!(h.engine.calls(FakeOp::Create), 0);
    }
}
