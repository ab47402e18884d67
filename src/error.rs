//! Error types for dockyard.

use std::time::Duration;

use uuid::Uuid;

use crate::record::LifecycleState;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors reported by a container engine adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Container engine unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Container {container_id} not found")]
    NotFound { container_id: String },

    #[error("Invalid container spec: {reason}")]
    SpecInvalid { reason: String },

    #[error("Engine resources exhausted: {reason}")]
    ResourceExhausted { reason: String },

    #[error("Container name {name} already in use")]
    Conflict { name: String },

    #[error("Engine call {operation} timed out after {after:?}; outcome unknown")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl EngineError {
    /// Whether the call's effect on the daemon is unknown and must be re-derived
    /// from live state instead of retried blindly.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}

/// Errors from the ownership index and its record stores.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
    #[error("Record {record_id} not found")]
    NotFound { record_id: Uuid },

    #[error("Record {record_id} is not owned by the requester")]
    NotOwned { record_id: Uuid },

    #[error("Engine container {container_id} already belongs to record {holder}")]
    DuplicateEngineId { container_id: String, holder: Uuid },

    #[error("Record {record_id} is deleted and can no longer change")]
    Immutable { record_id: Uuid },

    #[error("Record {record_id} cannot change owner")]
    OwnerChanged { record_id: Uuid },

    #[error("Record {record_id} already exists")]
    AlreadyExists { record_id: Uuid },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors surfaced by the lifecycle orchestrator and status reporter.
///
/// `NotFound` deliberately covers records owned by somebody else so callers
/// cannot probe for other users' containers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Container record {record_id} not found")]
    NotFound { record_id: Uuid },

    #[error("Cannot {action} container {record_id} while it is {state}")]
    InvalidTransition {
        record_id: Uuid,
        state: LifecycleState,
        action: &'static str,
    },

    #[error("Container for record {record_id} no longer exists; the record is now FAILED")]
    ContainerLost { record_id: Uuid },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Invalid container request: {reason}")]
    SpecInvalid { reason: String },

    #[error("Container engine unavailable, retry later: {reason}")]
    EngineUnavailable { reason: String },

    #[error("Resources exhausted: {reason}")]
    ResourceExhausted {
        reason: String,
        retry_after: Duration,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl OrchestratorError {
    /// Whether the same request may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::EngineUnavailable { .. }
                | OrchestratorError::ResourceExhausted { .. }
        )
    }
}

impl From<IndexError> for OrchestratorError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound { record_id } | IndexError::NotOwned { record_id } => {
                OrchestratorError::NotFound { record_id }
            }
            IndexError::DuplicateEngineId { .. } | IndexError::AlreadyExists { .. } => {
                OrchestratorError::Conflict {
                    reason: err.to_string(),
                }
            }
            IndexError::Immutable { record_id } => OrchestratorError::InvalidTransition {
                record_id,
                state: LifecycleState::Deleted,
                action: "modify",
            },
            IndexError::OwnerChanged { .. } | IndexError::Storage(_) => {
                OrchestratorError::Storage(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_owned_collapses_to_not_found() {
        let record_id = Uuid::new_v4();
        let err: OrchestratorError = IndexError::NotOwned { record_id }.into();
        assert!(matches!(err, OrchestratorError::NotFound { record_id: id } if id == record_id));
        assert_eq!(
            err.to_string(),
            IndexError::NotFound { record_id }.to_string().replace("Record", "Container record")
        );
    }

    #[test]
    fn only_timeouts_are_unknown_outcomes() {
        let timeout = EngineError::Timeout {
            operation: "start",
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_unknown_outcome());
        assert!(
            !EngineError::Unavailable {
                reason: "socket closed".into()
            }
            .is_unknown_outcome()
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(
            OrchestratorError::EngineUnavailable {
                reason: "down".into()
            }
            .is_retryable()
        );
        assert!(
            !OrchestratorError::SpecInvalid {
                reason: "bad".into()
            }
            .is_retryable()
        );
    }
}
