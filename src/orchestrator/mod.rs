//! Orchestrator for per-user nginx containers.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              Orchestrator                     │
//! │                                               │
//! │  Dashboard API (default :5000, configurable)  │
//! │    GET    /api/containers                     │
//! │    POST   /api/containers                     │
//! │    GET    /api/containers/{id}                │
//! │    POST   /api/containers/{id}/start          │
//! │    POST   /api/containers/{id}/stop           │
//! │    DELETE /api/containers/{id}                │
//! │    GET    /api/containers/{id}/logs           │
//! │                                               │
//! │  LifecycleOrchestrator                        │
//! │    request_create() -> PENDING -> CREATED     │
//! │    request_start() / request_stop()           │
//! │    request_delete() (idempotent)              │
//! │                                               │
//! │  PortAllocator                                │
//! │    lowest free host port in the range         │
//! └───────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod lifecycle;
pub mod ports;

pub use api::{AppState, DashboardApi};
pub use lifecycle::{CreateRequest, LifecycleOrchestrator, Outcome};
pub use ports::PortAllocator;
