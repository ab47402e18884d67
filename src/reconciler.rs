//! Background convergence of the ownership index with live daemon state.
//!
//! ```text
//!   interval tick ─┐
//!   trigger ───────┼──► sweep()
//!                  │      list_by_label(managed) once
//!                  │      per record (bounded JoinSet, record lock held):
//!                  │        delete / create retries, drift repair
//!                  │        (inspect under the lock), stray removal
//!                  │      orphans: adopt | remove | ignore
//!   shutdown ──────┘
//! ```
//!
//! A sweep never fails: every problem is logged and left for the next one.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::config::{EngineConfig, ReconcilerConfig};
use crate::engine::{ContainerEngine, EngineStatus, LABEL_DISPLAY_NAME, LabelSelector, LabeledContainer};
use crate::error::EngineError;
use crate::index::OwnershipIndex;
use crate::orchestrator::lifecycle::spec_for;
use crate::payload::PayloadStore;
use crate::record::{ContainerRecord, LifecycleState, PendingAction};

/// What to do with a managed container that no record accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Recreate a record from the container's labels.
    Adopt,
    /// Remove the container.
    Remove,
    /// Log and leave it alone.
    Ignore,
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adopt => write!(f, "adopt"),
            Self::Remove => write!(f, "remove"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adopt" => Ok(Self::Adopt),
            "remove" => Ok(Self::Remove),
            "ignore" => Ok(Self::Ignore),
            other => Err(format!(
                "unknown orphan policy '{}', expected adopt, remove or ignore",
                other
            )),
        }
    }
}

/// Wakes the reconciler ahead of its next tick.
#[derive(Debug, Clone, Default)]
pub struct ReconcileTrigger(Arc<Notify>);

impl ReconcileTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a sweep. Requests made while a sweep runs coalesce into one.
    pub fn request(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub repaired: usize,
    pub adopted: usize,
    pub removed: usize,
    pub failed: usize,
    pub errors: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.repaired += other.repaired;
        self.adopted += other.adopted;
        self.removed += other.removed;
        self.failed += other.failed;
        self.errors += other.errors;
    }

    /// Nothing was changed and nothing went wrong.
    pub fn is_quiet(&self) -> bool {
        self.repaired == 0
            && self.adopted == 0
            && self.removed == 0
            && self.failed == 0
            && self.errors == 0
    }
}

pub struct Reconciler {
    engine: Arc<dyn ContainerEngine>,
    index: Arc<OwnershipIndex>,
    payloads: PayloadStore,
    config: ReconcilerConfig,
    engine_config: EngineConfig,
    trigger: ReconcileTrigger,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        index: Arc<OwnershipIndex>,
        payloads: PayloadStore,
        config: ReconcilerConfig,
        engine_config: EngineConfig,
        trigger: ReconcileTrigger,
    ) -> Self {
        Self {
            engine,
            index,
            payloads,
            config,
            engine_config,
            trigger,
        }
    }

    /// Run the loop until `shutdown` fires. The first sweep runs immediately,
    /// which recovers records left mid-operation by a previous process.
    pub fn spawn(self: Arc<Self>, shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut shutdown = std::pin::pin!(shutdown);

            tracing::info!(
                interval_secs = self.config.interval_secs,
                concurrency = self.config.concurrency,
                orphan_policy = %self.config.orphan_policy,
                "Reconciler started"
            );

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = self.trigger.notified() => {
                        tracing::debug!("Reconcile sweep requested");
                    }
                    _ = &mut shutdown => {
                        tracing::info!("Reconciler shutting down");
                        break;
                    }
                }

                let report = self.sweep().await;
                if report.is_quiet() {
                    tracing::debug!(examined = report.examined, "Reconcile sweep found no drift");
                } else {
                    tracing::info!(
                        examined = report.examined,
                        repaired = report.repaired,
                        adopted = report.adopted,
                        removed = report.removed,
                        failed = report.failed,
                        errors = report.errors,
                        "Reconcile sweep finished"
                    );
                }
            }
        })
    }

    /// One full pass over every record and every managed container.
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let mut report = SweepReport::default();

        let listed = match self.engine.list_by_label(&LabelSelector::managed()).await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(error = %e, "Reconcile sweep skipped: cannot list containers");
                report.errors += 1;
                return report;
            }
        };
        let records = match self.index.list_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Reconcile sweep skipped: cannot read records");
                report.errors += 1;
                return report;
            }
        };

        let mut by_record: HashMap<Uuid, Vec<LabeledContainer>> = HashMap::new();
        let mut unlabeled = Vec::new();
        for container in listed {
            match container.record_id() {
                Some(id) => by_record.entry(id).or_default().push(container),
                None => unlabeled.push(container),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for record in &records {
            let labeled = by_record.remove(&record.record_id).unwrap_or_default();
            if record.is_deleted() && labeled.is_empty() {
                continue;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = Arc::clone(self);
            let record_id = record.record_id;
            tasks.spawn(async move {
                let outcome = this.repair_record(record_id, labeled).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.absorb(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "Reconcile task did not complete");
                    report.errors += 1;
                }
            }
        }

        // What remains is labeled with records the index has never seen.
        for (record_id, containers) in by_record {
            for container in containers {
                report.absorb(self.handle_orphan(Some(record_id), container).await);
            }
        }
        for container in unlabeled {
            report.absorb(self.handle_orphan(None, container).await);
        }

        let pruned = self.index.prune_locks();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned idle record locks");
        }
        report
    }

    async fn repair_record(&self, record_id: Uuid, labeled: Vec<LabeledContainer>) -> SweepReport {
        let mut report = SweepReport {
            examined: 1,
            ..Default::default()
        };
        let guard = self.index.lock(record_id).await;
        let mut record = match self.index.get_any(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return report,
            Err(e) => {
                tracing::error!(record_id = %record_id, error = %e, "Cannot read record for repair");
                report.errors += 1;
                return report;
            }
        };

        if record.is_deleted() {
            for container in &labeled {
                self.remove_stray(&record, container, &mut report).await;
            }
            return report;
        }

        let before = record.clone();
        if record.pending_reconcile == Some(PendingAction::Delete) {
            self.finish_delete(&mut record, &labeled, &mut report).await;
        } else if record.lifecycle_state == LifecycleState::Pending {
            self.finish_create(&mut record, &labeled, &mut report).await;
        } else if record.lifecycle_state == LifecycleState::Failed {
            self.clean_failed(&mut record, &labeled, &mut report).await;
        } else {
            self.repair_drift(&mut record, &labeled, &mut report).await;
        }

        if record != before {
            if let Err(e) = self.index.commit(&guard, &record).await {
                tracing::error!(record_id = %record_id, error = %e, "Failed to commit repaired record");
                report.errors += 1;
            } else if record.lifecycle_state != before.lifecycle_state {
                tracing::info!(
                    record_id = %record_id,
                    owner = %record.owner_id,
                    from = %before.lifecycle_state,
                    to = %record.lifecycle_state,
                    "Reconciled record state"
                );
            }
        }
        report
    }

    async fn finish_delete(
        &self,
        record: &mut ContainerRecord,
        labeled: &[LabeledContainer],
        report: &mut SweepReport,
    ) {
        if let Some(engine_id) = &record.engine_container_id {
            match self.engine.remove(engine_id, true).await {
                Ok(()) => report.removed += 1,
                Err(EngineError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(record_id = %record.record_id, error = %e, "Delete retry failed");
                    report.errors += 1;
                    return;
                }
            }
        }
        for container in labeled {
            if Some(&container.id) != record.engine_container_id.as_ref() {
                self.remove_stray(record, container, report).await;
            }
        }
        if let Err(e) = self.payloads.remove(&record.html_payload_ref).await {
            tracing::warn!(record_id = %record.record_id, error = %e, "Failed to remove page payload");
        }
        record.transition(LifecycleState::Deleted);
        report.repaired += 1;
    }

    async fn finish_create(
        &self,
        record: &mut ContainerRecord,
        labeled: &[LabeledContainer],
        report: &mut SweepReport,
    ) {
        let (mine, foreign): (Vec<&LabeledContainer>, Vec<&LabeledContainer>) = labeled
            .iter()
            .partition(|c| c.owner_id().as_ref() == Some(&record.owner_id));

        if let Some((first, duplicates)) = mine.split_first() {
            tracing::info!(
                record_id = %record.record_id,
                engine_id = %first.id,
                "Adopting container created before the outcome was known"
            );
            record.engine_container_id = Some(first.id.clone());
            record.last_known_engine_status = Some(first.status);
            record.pending_reconcile = None;
            record.transition(if first.status == EngineStatus::Running {
                LifecycleState::Running
            } else {
                LifecycleState::Created
            });
            report.repaired += 1;
            for container in duplicates {
                self.remove_stray(record, container, report).await;
            }
        } else {
            match self.engine.create(&spec_for(&self.engine_config, record)).await {
                Ok(engine_id) => {
                    tracing::info!(record_id = %record.record_id, engine_id = %engine_id, "Completed pending create");
                    record.engine_container_id = Some(engine_id);
                    record.last_known_engine_status = Some(EngineStatus::Exited);
                    record.pending_reconcile = None;
                    record.transition(LifecycleState::Created);
                    report.repaired += 1;
                }
                Err(EngineError::SpecInvalid { reason }) => {
                    tracing::warn!(record_id = %record.record_id, reason = %reason, "Pending create rejected");
                    record.pending_reconcile = None;
                    record.transition(LifecycleState::Failed);
                    report.failed += 1;
                }
                Err(EngineError::ResourceExhausted { reason }) => {
                    tracing::warn!(record_id = %record.record_id, reason = %reason, "Pending create out of resources");
                    record.pending_reconcile = Some(PendingAction::Cleanup);
                    record.transition(LifecycleState::Failed);
                    report.failed += 1;
                }
                Err(e) => {
                    // Conflict means a container exists that the listing
                    // missed; the next sweep adopts it.
                    tracing::warn!(record_id = %record.record_id, error = %e, "Pending create still unresolved");
                    report.errors += 1;
                }
            }
        }

        for container in foreign {
            self.remove_stray(record, container, report).await;
        }

        if self.engine_config.auto_start
            && record.lifecycle_state == LifecycleState::Created
            && let Some(engine_id) = record.engine_container_id.clone()
        {
            match self.engine.start(&engine_id).await {
                Ok(()) => {
                    record.last_known_engine_status = Some(EngineStatus::Running);
                    record.transition(LifecycleState::Running);
                }
                Err(e) => {
                    tracing::warn!(record_id = %record.record_id, error = %e, "Auto-start after recovered create failed");
                }
            }
        }
    }

    async fn clean_failed(
        &self,
        record: &mut ContainerRecord,
        labeled: &[LabeledContainer],
        report: &mut SweepReport,
    ) {
        if record.pending_reconcile != Some(PendingAction::Cleanup) {
            return;
        }
        let mut clean = true;
        if let Some(engine_id) = record.engine_container_id.clone() {
            match self.engine.remove(&engine_id, true).await {
                Ok(()) => report.removed += 1,
                Err(EngineError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(record_id = %record.record_id, error = %e, "Failed to remove container of failed record");
                    report.errors += 1;
                    clean = false;
                }
            }
        }
        for container in labeled {
            if Some(&container.id) != record.engine_container_id.as_ref()
                && !self.remove_stray(record, container, report).await
            {
                clean = false;
            }
        }
        if clean {
            record.engine_container_id = None;
            record.pending_reconcile = None;
            record.touch();
            report.repaired += 1;
        }
    }

    async fn repair_drift(
        &self,
        record: &mut ContainerRecord,
        labeled: &[LabeledContainer],
        report: &mut SweepReport,
    ) {
        let Some(engine_id) = record.engine_container_id.clone() else {
            // CREATED/RUNNING/STOPPED always carry an engine id.
            tracing::error!(record_id = %record.record_id, state = %record.lifecycle_state, "Record has no container");
            record.pending_reconcile = Some(PendingAction::Cleanup);
            record.transition(LifecycleState::Failed);
            report.failed += 1;
            return;
        };

        // The listing predates the lock; a transition committed in between
        // would be reverted by trusting it.
        match self.engine.inspect(&engine_id).await {
            Err(EngineError::NotFound { .. }) => {
                tracing::warn!(
                    record_id = %record.record_id,
                    engine_id = %engine_id,
                    "Container disappeared from the daemon"
                );
                record.engine_container_id = None;
                record.last_known_engine_status = None;
                record.pending_reconcile = Some(PendingAction::Cleanup);
                record.transition(LifecycleState::Failed);
                report.failed += 1;
            }
            Err(e) => {
                tracing::warn!(record_id = %record.record_id, error = %e, "Cannot inspect container");
                report.errors += 1;
                return;
            }
            Ok(status) => {
                let next = match (status, record.lifecycle_state) {
                    (EngineStatus::Exited, LifecycleState::Running) => LifecycleState::Stopped,
                    (EngineStatus::Running, LifecycleState::Created | LifecycleState::Stopped) => {
                        LifecycleState::Running
                    }
                    (_, current) => current,
                };
                if next != record.lifecycle_state {
                    record.transition(next);
                    report.repaired += 1;
                }
                if record.last_known_engine_status != Some(status) {
                    record.last_known_engine_status = Some(status);
                    record.touch();
                }
                if matches!(
                    record.pending_reconcile,
                    Some(PendingAction::Start | PendingAction::Stop)
                ) {
                    record.pending_reconcile = None;
                    record.touch();
                }
            }
        }

        for container in labeled {
            if container.id != engine_id {
                self.remove_stray(record, container, report).await;
            }
        }
    }

    /// Remove a labeled container that must not exist. Returns whether it
    /// is gone.
    async fn remove_stray(
        &self,
        record: &ContainerRecord,
        container: &LabeledContainer,
        report: &mut SweepReport,
    ) -> bool {
        let gone = self.confirm_and_remove(container, report).await;
        if gone {
            tracing::info!(
                record_id = %record.record_id,
                engine_id = %container.id,
                "Removed stray container"
            );
        }
        gone
    }

    /// Force-remove a container after `inspect` confirms it still exists.
    /// Returns whether it is gone.
    async fn confirm_and_remove(&self, container: &LabeledContainer, report: &mut SweepReport) -> bool {
        match self.engine.inspect(&container.id).await {
            Err(EngineError::NotFound { .. }) => return true,
            Err(e) => {
                tracing::warn!(engine_id = %container.id, error = %e, "Cannot confirm container before removal");
                report.errors += 1;
                return false;
            }
            Ok(_) => {}
        }
        match self.engine.remove(&container.id, true).await {
            Ok(()) | Err(EngineError::NotFound { .. }) => {
                report.removed += 1;
                true
            }
            Err(e) => {
                tracing::warn!(engine_id = %container.id, error = %e, "Failed to remove container");
                report.errors += 1;
                false
            }
        }
    }

    /// A managed container whose record is unknown to the index.
    async fn handle_orphan(&self, record_id: Option<Uuid>, container: LabeledContainer) -> SweepReport {
        let mut report = SweepReport::default();
        let policy = self.config.orphan_policy;

        let adoptable = record_id.zip(container.owner_id()).zip(container.host_port());
        match (policy, adoptable) {
            (OrphanPolicy::Ignore, _) | (OrphanPolicy::Adopt, None) => {
                tracing::warn!(engine_id = %container.id, policy = %policy, "Leaving orphaned container alone");
            }
            (OrphanPolicy::Remove, _) => {
                // Hold the labeled record's lock so a concurrent insert cannot
                // claim the container while it is removed.
                let _guard = match record_id {
                    Some(id) => Some(self.index.lock(id).await),
                    None => None,
                };
                if let Some(id) = record_id {
                    match self.index.get_any(id).await {
                        Ok(None) => {}
                        // Inserted since the sweep started; the next sweep sees it.
                        Ok(Some(_)) => return report,
                        Err(e) => {
                            tracing::error!(record_id = %id, error = %e, "Cannot check orphan record");
                            report.errors += 1;
                            return report;
                        }
                    }
                }
                if self.confirm_and_remove(&container, &mut report).await {
                    tracing::info!(engine_id = %container.id, "Removed orphaned container");
                }
            }
            (OrphanPolicy::Adopt, Some(((record_id, owner), host_port))) => {
                let _guard = self.index.lock(record_id).await;
                match self.index.get_any(record_id).await {
                    Ok(None) => {}
                    // Inserted since the sweep started; the next sweep sees it.
                    Ok(Some(_)) => return report,
                    Err(e) => {
                        tracing::error!(record_id = %record_id, error = %e, "Cannot check orphan record");
                        report.errors += 1;
                        return report;
                    }
                }
                let port_taken = match self.index.list_all().await {
                    Ok(records) => records
                        .iter()
                        .any(|r| !r.is_deleted() && r.host_port == host_port),
                    Err(e) => {
                        tracing::error!(error = %e, "Cannot read records for adoption");
                        report.errors += 1;
                        return report;
                    }
                };
                if port_taken {
                    tracing::warn!(
                        engine_id = %container.id,
                        port = host_port,
                        "Orphan's host port belongs to another record; not adopting"
                    );
                    return report;
                }

                let display_name = container
                    .labels
                    .get(LABEL_DISPLAY_NAME)
                    .cloned()
                    .unwrap_or_else(|| format!("adopted-{}", &container.id));
                let mut record = ContainerRecord::pending(
                    record_id,
                    owner,
                    display_name,
                    self.payloads.dir_for(record_id),
                    host_port,
                );
                record.engine_container_id = Some(container.id.clone());
                record.last_known_engine_status = Some(container.status);
                record.transition(if container.status == EngineStatus::Running {
                    LifecycleState::Running
                } else {
                    LifecycleState::Stopped
                });
                match self.index.insert(&record).await {
                    Ok(()) => {
                        tracing::info!(
                            record_id = %record_id,
                            owner = %record.owner_id,
                            engine_id = %container.id,
                            "Adopted orphaned container"
                        );
                        report.adopted += 1;
                    }
                    Err(e) => {
                        tracing::warn!(engine_id = %container.id, error = %e, "Failed to adopt orphaned container");
                        report.errors += 1;
                    }
                }
            }
        }
        report
    }
}
