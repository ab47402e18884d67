//! End-to-end lifecycle tests against the in-memory engine.
//!
//! Exercises the orchestrator, reconciler and status reporter together over
//! a shared index, including concurrent requests and process restarts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dockyard::config::{EngineConfig, ReconcilerConfig};
use dockyard::engine::EngineStatus;
use dockyard::error::OrchestratorError;
use dockyard::index::{InMemoryRecordStore, JsonFileRecordStore, OwnershipIndex, RecordStore};
use dockyard::orchestrator::{CreateRequest, LifecycleOrchestrator};
use dockyard::payload::PayloadStore;
use dockyard::reconciler::{ReconcileTrigger, Reconciler};
use dockyard::record::{LifecycleState, OwnerId};
use dockyard::status::StatusReporter;
use dockyard::testing::{FakeEngine, FakeOp, Fault};

// ---------------------------------------------------------------------------
// Test system
// ---------------------------------------------------------------------------

struct System {
    engine: Arc<FakeEngine>,
    index: Arc<OwnershipIndex>,
    orchestrator: Arc<LifecycleOrchestrator>,
    reconciler: Arc<Reconciler>,
    status: StatusReporter,
}

async fn system_with(
    engine: Arc<FakeEngine>,
    store: Arc<dyn RecordStore>,
    pages: &std::path::Path,
    config: EngineConfig,
) -> System {
    let index = Arc::new(OwnershipIndex::load(store).await.unwrap());
    let payloads = PayloadStore::new(pages);
    let trigger = ReconcileTrigger::new();
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        config.clone(),
        engine.clone(),
        index.clone(),
        payloads.clone(),
        trigger.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        engine.clone(),
        index.clone(),
        payloads,
        ReconcilerConfig::default(),
        config.clone(),
        trigger.clone(),
    ));
    let status = StatusReporter::new(engine.clone(), index.clone(), &config, Duration::ZERO, trigger);
    System {
        engine,
        index,
        orchestrator,
        reconciler,
        status,
    }
}

async fn system(pages: &std::path::Path, config: EngineConfig) -> System {
    system_with(
        Arc::new(FakeEngine::new()),
        Arc::new(InMemoryRecordStore::new()),
        pages,
        config,
    )
    .await
}

fn manual_start() -> EngineConfig {
    EngineConfig {
        auto_start: false,
        ..Default::default()
    }
}

fn named(name: &str) -> CreateRequest {
    CreateRequest {
        display_name: Some(name.to_string()),
        html: Some(format!("<!DOCTYPE html><html><body><h1>{}</h1></body></html>", name)),
    }
}

/// No two non-deleted records may claim the same container.
async fn assert_unique_engine_ids(sys: &System, owners: &[OwnerId]) {
    let mut seen = HashSet::new();
    for owner in owners {
        for record in sys.index.list_by_owner(owner).await.unwrap() {
            if record.is_deleted() {
                continue;
            }
            if let Some(id) = record.engine_container_id {
                assert!(seen.insert(id.clone()), "engine id {} claimed twice", id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_start_and_report_running() {
    let pages = tempfile::tempdir().unwrap();
    let sys = system(pages.path(), manual_start()).await;
    let alice = OwnerId::new("alice");

    let record = sys
        .orchestrator
        .request_create(&alice, named("Hello A"))
        .await
        .unwrap()
        .into_record();
    assert_eq!(record.lifecycle_state, LifecycleState::Created);

    let html = std::fs::read_to_string(record.html_payload_ref.join("index.html")).unwrap();
    assert!(html.contains("<h1>Hello A</h1>"));

    sys.orchestrator
        .request_start(&alice, record.record_id)
        .await
        .unwrap();
    let view = sys.status.get(&alice, record.record_id).await.unwrap();
    assert_eq!(view.record.lifecycle_state, LifecycleState::Running);
    assert_eq!(view.live_status, Some(EngineStatus::Running));
    assert!(!view.stale);
}

#[tokio::test]
async fn test_owners_are_isolated() {
    let pages = tempfile::tempdir().unwrap();
    let sys = system(pages.path(), EngineConfig::default()).await;
    let alice = OwnerId::new("alice");
    let bob = OwnerId::new("bob");

    let a = sys
        .orchestrator
        .request_create(&alice, named("site"))
        .await
        .unwrap()
        .into_record();
    let b = sys
        .orchestrator
        .request_create(&bob, named("site"))
        .await
        .unwrap()
        .into_record();
    assert_ne!(a.host_port, b.host_port);

    let alice_view: Vec<_> = sys
        .status
        .list(&alice)
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.record.record_id)
        .collect();
    assert_eq!(alice_view, vec![a.record_id]);

    assert!(matches!(
        sys.status.get(&alice, b.record_id).await,
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(matches!(
        sys.orchestrator.request_delete(&alice, b.record_id).await,
        Err(OrchestratorError::NotFound { .. })
    ));
    let still_running = sys.index.get(b.record_id, &bob).await.unwrap();
    assert_eq!(still_running.lifecycle_state, LifecycleState::Running);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let pages = tempfile::tempdir().unwrap();
    let sys = system(pages.path(), EngineConfig::default()).await;
    let alice = OwnerId::new("alice");
    let record = sys
        .orchestrator
        .request_create(&alice, named("x"))
        .await
        .unwrap()
        .into_record();

    let first = sys
        .orchestrator
        .request_delete(&alice, record.record_id)
        .await
        .unwrap()
        .into_record();
    let second = sys
        .orchestrator
        .request_delete(&alice, record.record_id)
        .await
        .unwrap()
        .into_record();
    assert_eq!(first, second);
    assert_eq!(sys.engine.count(), 0);
    assert!(sys.status.list(&alice).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_delete_keeps_engine_ids_unique() {
    let pages = tempfile::tempdir().unwrap();
    let sys = Arc::new(system(pages.path(), EngineConfig::default()).await);
    let owners: Vec<OwnerId> = (0..4).map(|i| OwnerId::new(format!("user{}", i))).collect();

    let mut tasks = tokio::task::JoinSet::new();
    for (i, owner) in owners.iter().cloned().enumerate() {
        let sys = sys.clone();
        tasks.spawn(async move {
            for round in 0..10 {
                let created = sys
                    .orchestrator
                    .request_create(&owner, CreateRequest::default())
                    .await
                    .unwrap()
                    .into_record();
                if (round + i) % 2 == 0 {
                    sys.orchestrator
                        .request_delete(&owner, created.record_id)
                        .await
                        .unwrap();
                }
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    assert_unique_engine_ids(&sys, &owners).await;
    let live: usize = {
        let mut n = 0;
        for owner in &owners {
            n += sys.status.list(owner).await.unwrap().len();
        }
        n
    };
    assert_eq!(live, 20);
    assert_eq!(sys.engine.count(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_delete_and_start_serialize() {
    let pages = tempfile::tempdir().unwrap();
    let sys = Arc::new(system(pages.path(), manual_start()).await);
    let alice = OwnerId::new("alice");
    let record = sys
        .orchestrator
        .request_create(&alice, named("race"))
        .await
        .unwrap()
        .into_record();

    let starter = {
        let sys = sys.clone();
        let alice = alice.clone();
        tokio::spawn(async move { sys.orchestrator.request_start(&alice, record.record_id).await })
    };
    let deleter = {
        let sys = sys.clone();
        let alice = alice.clone();
        tokio::spawn(async move { sys.orchestrator.request_delete(&alice, record.record_id).await })
    };
    let started = starter.await.unwrap();
    let deleted = deleter.await.unwrap().unwrap();
    assert_eq!(deleted.record().lifecycle_state, LifecycleState::Deleted);

    // Either start won the lock first and succeeded, or it saw DELETED.
    match started {
        Ok(outcome) => assert_eq!(outcome.record().lifecycle_state, LifecycleState::Running),
        Err(err) => assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                state: LifecycleState::Deleted,
                ..
            }
        )),
    }
    let last = sys.index.get(record.record_id, &alice).await.unwrap();
    assert_eq!(last.lifecycle_state, LifecycleState::Deleted);
    assert_eq!(sys.engine.count(), 0);
}

#[tokio::test]
async fn test_accepted_delete_survives_later_start() {
    let pages = tempfile::tempdir().unwrap();
    let sys = system(pages.path(), manual_start()).await;
    let alice = OwnerId::new("alice");
    let record = sys
        .orchestrator
        .request_create(&alice, named("doomed"))
        .await
        .unwrap()
        .into_record();

    sys.engine.inject(FakeOp::Remove, Fault::Unavailable);
    assert!(
        sys.orchestrator
            .request_delete(&alice, record.record_id)
            .await
            .unwrap()
            .is_pending()
    );
    assert!(matches!(
        sys.orchestrator.request_start(&alice, record.record_id).await,
        Err(OrchestratorError::Conflict { .. })
    ));

    sys.reconciler.sweep().await;
    let after = sys.index.get(record.record_id, &alice).await.unwrap();
    assert_eq!(after.lifecycle_state, LifecycleState::Deleted);
    assert_eq!(sys.engine.count(), 0);
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_one_sweep_converges_after_timeouts() {
    let pages = tempfile::tempdir().unwrap();
    let sys = system(pages.path(), manual_start()).await;
    let alice = OwnerId::new("alice");

    sys.engine.inject(FakeOp::Create, Fault::TimeoutAfterEffect);
    let pending_create = sys
        .orchestrator
        .request_create(&alice, named("created-late"))
        .await
        .unwrap();
    assert!(pending_create.is_pending());

    let to_start = sys
        .orchestrator
        .request_create(&alice, named("started-late"))
        .await
        .unwrap()
        .into_record();
    sys.engine.inject(FakeOp::Start, Fault::TimeoutAfterEffect);
    assert!(
        sys.orchestrator
            .request_start(&alice, to_start.record_id)
            .await
            .is_err()
    );

    let to_delete = sys
        .orchestrator
        .request_create(&alice, named("deleted-late"))
        .await
        .unwrap()
        .into_record();
    sys.engine.inject(FakeOp::Remove, Fault::TimeoutAfterEffect);
    assert!(
        sys.orchestrator
            .request_delete(&alice, to_delete.record_id)
            .await
            .unwrap()
            .is_pending()
    );

    sys.reconciler.sweep().await;

    let records = sys.index.list_by_owner(&alice).await.unwrap();
    for record in &records {
        assert!(record.pending_reconcile.is_none(), "{:?}", record);
    }
    let state_of = |id| {
        records
            .iter()
            .find(|r| r.record_id == id)
            .map(|r| r.lifecycle_state)
    };
    assert_eq!(state_of(pending_create.record().record_id), Some(LifecycleState::Created));
    assert_eq!(state_of(to_start.record_id), Some(LifecycleState::Running));
    assert_eq!(state_of(to_delete.record_id), Some(LifecycleState::Deleted));
    assert_eq!(sys.engine.count(), 2);

    // A second sweep has nothing left to do.
    assert!(sys.reconciler.sweep().await.is_quiet());
}

#[tokio::test]
async fn test_not_found_during_start_fails_the_record() {
    let pages = tempfile::tempdir().unwrap();
    let sys = system(pages.path(), manual_start()).await;
    let alice = OwnerId::new("alice");
    let record = sys
        .orchestrator
        .request_create(&alice, named("gone"))
        .await
        .unwrap()
        .into_record();
    sys.engine.inject(FakeOp::Start, Fault::NotFound);

    assert!(matches!(
        sys.orchestrator.request_start(&alice, record.record_id).await,
        Err(OrchestratorError::ContainerLost { .. })
    ));
    assert_eq!(
        sys.index.get(record.record_id, &alice).await.unwrap().lifecycle_state,
        LifecycleState::Failed
    );

    // The container still exists daemon-side; cleanup removes it.
    sys.reconciler.sweep().await;
    assert_eq!(sys.engine.count(), 0);
    let failed = sys.index.get(record.record_id, &alice).await.unwrap();
    assert_eq!(failed.lifecycle_state, LifecycleState::Failed);
    assert!(failed.pending_reconcile.is_none());

    // FAILED is only left by deleting.
    assert!(matches!(
        sys.orchestrator.request_start(&alice, record.record_id).await,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    sys.orchestrator
        .request_delete(&alice, record.record_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_restart_recovers_interrupted_create() {
    let home = tempfile::tempdir().unwrap();
    let state_file = home.path().join("records.json");
    let pages = home.path().join("pages");
    let engine = Arc::new(FakeEngine::new());
    let alice = OwnerId::new("alice");

    let record_id = {
        let store = Arc::new(JsonFileRecordStore::open(&state_file).await.unwrap());
        let sys = system_with(engine.clone(), store, &pages, manual_start()).await;
        sys.engine.inject(FakeOp::Create, Fault::TimeoutBeforeEffect);
        let outcome = sys
            .orchestrator
            .request_create(&alice, named("survivor"))
            .await
            .unwrap();
        assert!(outcome.is_pending());
        outcome.record().record_id
    };

    // New process over the same state file and daemon.
    let store = Arc::new(JsonFileRecordStore::open(&state_file).await.unwrap());
    let sys = system_with(engine, store, &pages, manual_start()).await;
    let reloaded = sys.index.get(record_id, &alice).await.unwrap();
    assert_eq!(reloaded.lifecycle_state, LifecycleState::Pending);

    sys.reconciler.sweep().await;
    let recovered = sys.index.get(record_id, &alice).await.unwrap();
    assert_eq!(recovered.lifecycle_state, LifecycleState::Created);
    assert_eq!(sys.engine.count(), 1);
}
