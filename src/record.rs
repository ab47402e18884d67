//! Container records and their lifecycle states.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::EngineStatus;

/// Identity of a user as supplied by the authentication layer.
///
/// The core never validates credentials; it only compares owner ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a container record.
///
/// ```text
///   Pending ──▶ Created ──▶ Running ⇄ Stopped
///      │           │           │         │
///      └───────────┴─────┬─────┴─────────┘
///                        ▼
///                     Failed ──▶ Deleted   (Deleted reachable from every state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Pending,
    Created,
    Running,
    Stopped,
    Failed,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// States in which a start request is accepted.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }

    /// States in which a stop request is accepted.
    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (_, Failed) => true,
            (Pending, Created) => true,
            (Created, Running) | (Stopped, Running) => true,
            (Running, Stopped) => true,
            (a, b) => *a == b,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A daemon call whose outcome is not yet known, or follow-up work the
/// reconciler owes a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingAction {
    Create,
    Start,
    Stop,
    Delete,
    /// The record failed; any container still labeled with it is a stray.
    Cleanup,
}

impl std::fmt::Display for PendingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Delete => write!(f, "delete"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// A user-owned logical container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub record_id: Uuid,
    pub owner_id: OwnerId,
    pub engine_container_id: Option<String>,
    pub display_name: String,
    /// Host directory holding the rendered `index.html`.
    pub html_payload_ref: PathBuf,
    pub host_port: u16,
    pub lifecycle_state: LifecycleState,
    pub last_known_engine_status: Option<EngineStatus>,
    pub pending_reconcile: Option<PendingAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// A fresh record in `PENDING`.
    pub fn pending(
        record_id: Uuid,
        owner_id: OwnerId,
        display_name: impl Into<String>,
        html_payload_ref: PathBuf,
        host_port: u16,
    ) -> Self {
        let now = Utc::now();
        Self {
            record_id,
            owner_id,
            engine_container_id: None,
            display_name: display_name.into(),
            html_payload_ref,
            host_port,
            lifecycle_state: LifecycleState::Pending,
            last_known_engine_status: None,
            pending_reconcile: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle_state == LifecycleState::Deleted
    }

    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        &self.owner_id == owner
    }

    /// Move to `next`, stamping `updated_at`. Callers validate the transition.
    pub fn transition(&mut self, next: LifecycleState) {
        self.lifecycle_state = next;
        if next == LifecycleState::Deleted {
            self.engine_container_id = None;
            self.pending_reconcile = None;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ContainerRecord {
        ContainerRecord::pending(
            Uuid::new_v4(),
            OwnerId::new("alice"),
            "Hello A",
            PathBuf::from("/tmp/pages/a"),
            8000,
        )
    }

    #[test]
    fn state_machine_edges() {
        use LifecycleState::*;
        assert!(Pending.can_transition_to(Created));
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Deleted));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Created));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(Pending));
        assert!(!Deleted.can_transition_to(Failed));
    }

    #[test]
    fn start_and_stop_guards() {
        assert!(LifecycleState::Created.can_start());
        assert!(LifecycleState::Stopped.can_start());
        assert!(!LifecycleState::Pending.can_start());
        assert!(LifecycleState::Running.can_stop());
        assert!(!LifecycleState::Pending.can_stop());
    }

    #[test]
    fn deleting_clears_engine_reference() {
        let mut rec = record();
        rec.engine_container_id = Some("abc".into());
        rec.pending_reconcile = Some(PendingAction::Delete);
        rec.transition(LifecycleState::Deleted);
        assert!(rec.is_deleted());
        assert!(rec.engine_container_id.is_none());
        assert!(rec.pending_reconcile.is_none());
    }

    #[test]
    fn serializes_states_in_upper_case() {
        let json = serde_json::to_value(LifecycleState::Running).unwrap();
        assert_eq!(json, "RUNNING");
        let rec = record();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["owner_id"], "alice");
        assert_eq!(json["lifecycle_state"], "PENDING");
    }
}
