//! dockyard: per-user nginx containers on a shared Docker host.
//!
//! Users create, start, stop and delete nginx containers serving their own
//! page. Records live in an [`index::OwnershipIndex`]; the
//! [`orchestrator::LifecycleOrchestrator`] drives them through the daemon
//! via [`engine::ContainerEngine`], and the [`reconciler::Reconciler`] keeps
//! both sides converged.

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod orchestrator;
pub mod payload;
pub mod reconciler;
pub mod record;
pub mod status;
pub mod testing;

pub use config::Config;
pub use error::{ConfigError, EngineError, IndexError, OrchestratorError};
