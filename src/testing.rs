//! Test doubles shared by unit and integration tests.
//!
//! [`FakeEngine`] is an in-memory container engine with fault injection, so
//! orchestrator and reconciler behavior can be exercised without a daemon.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::engine::{ContainerEngine, ContainerSpec, EngineStatus, LabelSelector, LabeledContainer};
use crate::error::EngineError;

/// Engine operations faults can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    List,
    Logs,
}

/// A scripted failure for the next call of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    NotFound,
    SpecInvalid,
    ResourceExhausted,
    /// The call takes effect on the daemon but the caller sees a timeout.
    TimeoutAfterEffect,
    /// The call never reaches the daemon and the caller sees a timeout.
    TimeoutBeforeEffect,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub status: EngineStatus,
    pub spec: Option<ContainerSpec>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    faults: HashMap<FakeOp, VecDeque<Fault>>,
    calls: Vec<FakeOp>,
    down: bool,
    inspect_delays: HashMap<String, Duration>,
    list_hold: Option<ListHold>,
}

/// Parks the next `list_by_label` call after its snapshot is taken.
#[derive(Clone)]
struct ListHold {
    listed: Arc<Notify>,
    release: Arc<Notify>,
}

/// Handle for a listing parked by [`FakeEngine::hold_next_list`].
pub struct HeldList {
    listed: Arc<Notify>,
    release: Arc<Notify>,
}

impl HeldList {
    /// Wait until the listing has been taken.
    pub async fn listed(&self) {
        self.listed.notified().await;
    }

    /// Let the listing return its (now possibly stale) snapshot.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// In-memory [`ContainerEngine`].
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next call of `op`.
    pub fn inject(&self, op: FakeOp, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Delay every `inspect` of one container, as a wedged container would.
    pub fn delay_inspect(&self, id: &str, delay: Duration) {
        self.lock().inspect_delays.insert(id.to_string(), delay);
    }

    /// Park the next listing between taking its snapshot and returning it.
    pub fn hold_next_list(&self) -> HeldList {
        let hold = ListHold {
            listed: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        self.lock().list_hold = Some(hold.clone());
        HeldList {
            listed: hold.listed,
            release: hold.release,
        }
    }

    /// Remove a container behind the orchestrator's back.
    pub fn vanish(&self, id: &str) {
        self.lock().containers.remove(id);
    }

    /// Force a container's status (e.g. simulate a crash to `exited`).
    pub fn set_status(&self, id: &str, status: EngineStatus) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.status = status;
        }
    }

    /// Insert a container directly, as if created by another process.
    pub fn spawn_unmanaged(&self, labels: HashMap<String, String>, status: EngineStatus) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("fake{:08}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: id.clone(),
                labels,
                status,
                spec: None,
            },
        );
        id
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.lock().containers.get(id).cloned()
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn calls(&self, op: FakeOp) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and pop a scripted fault, if any.
    fn begin(&self, op: FakeOp) -> Option<Fault> {
        let mut state = self.lock();
        state.calls.push(op);
        if state.down {
            return Some(Fault::Unavailable);
        }
        state.faults.get_mut(&op).and_then(|q| q.pop_front())
    }
}

fn fault_error(fault: Fault, operation: &'static str, target: &str) -> EngineError {
    match fault {
        Fault::Unavailable => EngineError::Unavailable {
            reason: format!("fake daemon refused {}", operation),
        },
        Fault::NotFound => EngineError::NotFound {
            container_id: target.to_string(),
        },
        Fault::SpecInvalid => EngineError::SpecInvalid {
            reason: "fake: no such image".to_string(),
        },
        Fault::ResourceExhausted => EngineError::ResourceExhausted {
            reason: "fake: port is already allocated".to_string(),
        },
        Fault::TimeoutAfterEffect | Fault::TimeoutBeforeEffect => EngineError::Timeout {
            operation,
            after: Duration::from_millis(1),
        },
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.lock().down {
            return Err(fault_error(Fault::Unavailable, "ping", "daemon"));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        tokio::task::yield_now().await;
        let fault = self.begin(FakeOp::Create);
        match fault {
            None | Some(Fault::TimeoutAfterEffect) => {}
            Some(f) => return Err(fault_error(f, "create", &spec.name)),
        }

        let mut state = self.lock();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict {
                name: spec.name.clone(),
            });
        }
        state.next_id += 1;
        let id = format!("fake{:08}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                status: EngineStatus::Exited,
                spec: Some(spec.clone()),
            },
        );
        match fault {
            Some(f) => Err(fault_error(f, "create", &spec.name)),
            None => Ok(id),
        }
    }

    async fn start(&self, container_id: &str) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.set_state(FakeOp::Start, "start", container_id, EngineStatus::Running)
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.set_state(FakeOp::Stop, "stop", container_id, EngineStatus::Exited)
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        let fault = self.begin(FakeOp::Remove);
        match fault {
            None | Some(Fault::TimeoutAfterEffect) => {}
            Some(f) => return Err(fault_error(f, "remove", container_id)),
        }
        let removed = self.lock().containers.remove(container_id);
        match (fault, removed) {
            (Some(f), _) => Err(fault_error(f, "remove", container_id)),
            (None, Some(_)) => Ok(()),
            (None, None) => Err(fault_error(Fault::NotFound, "remove", container_id)),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<EngineStatus, EngineError> {
        let delay = self.lock().inspect_delays.get(container_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(f) = self.begin(FakeOp::Inspect) {
            return Err(fault_error(f, "inspect", container_id));
        }
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.status)
            .ok_or_else(|| fault_error(Fault::NotFound, "inspect", container_id))
    }

    async fn list_by_label(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<LabeledContainer>, EngineError> {
        if let Some(f) = self.begin(FakeOp::List) {
            return Err(fault_error(f, "list", "containers"));
        }
        let mut listed: Vec<_> = self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| selector.matches(&c.labels))
            .map(|(id, c)| LabeledContainer {
                id: id.clone(),
                labels: c.labels.clone(),
                status: c.status,
            })
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));

        let hold = self.lock().list_hold.take();
        if let Some(hold) = hold {
            hold.listed.notify_one();
            hold.release.notified().await;
        }
        Ok(listed)
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String, EngineError> {
        if let Some(f) = self.begin(FakeOp::Logs) {
            return Err(fault_error(f, "logs", container_id));
        }
        let state = self.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| fault_error(Fault::NotFound, "logs", container_id))?;
        let lines: Vec<String> = (1..=3)
            .map(|i| format!("{} access line {}", container.name, i))
            .collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].join("\n"))
    }
}

impl FakeEngine {
    fn set_state(
        &self,
        op: FakeOp,
        operation: &'static str,
        container_id: &str,
        status: EngineStatus,
    ) -> Result<(), EngineError> {
        let fault = self.begin(op);
        match fault {
            None | Some(Fault::TimeoutAfterEffect) => {}
            Some(f) => return Err(fault_error(f, operation, container_id)),
        }
        let mut state = self.lock();
        let Some(container) = state.containers.get_mut(container_id) else {
            return Err(fault_error(Fault::NotFound, operation, container_id));
        };
        container.status = status;
        match fault {
            Some(f) => Err(fault_error(f, operation, container_id)),
            None => Ok(()),
        }
    }
}
