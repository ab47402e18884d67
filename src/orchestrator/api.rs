//! Dashboard-facing HTTP API.
//!
//! Every `/api/` route is owner-scoped: the authenticating proxy in front of
//! dockyard sets `X-Owner-Id`, and requests without it are rejected before
//! any handler runs.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::orchestrator::lifecycle::{CreateRequest, LifecycleOrchestrator, Outcome};
use crate::record::OwnerId;
use crate::status::{ContainerStatusView, RecordSummary, StatusReporter};

/// Header carrying the authenticated user id.
pub const OWNER_HEADER: &str = "x-owner-id";

const DEFAULT_LOG_TAIL: usize = 100;
const MAX_LOG_TAIL: usize = 5000;

/// Shared state for the API.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub status: Arc<StatusReporter>,
}

/// Body returned by state-changing routes.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    #[serde(flatten)]
    pub record: RecordSummary,
    pub url: String,
    /// The daemon's answer is outstanding; poll the record for the result.
    pub pending: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub record_id: Uuid,
    pub logs: String,
}

pub struct DashboardApi;

impl DashboardApi {
    /// Build the axum router for the API.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/api/containers", get(list_containers).post(create_container))
            .route(
                "/api/containers/{id}",
                get(get_container).delete(delete_container),
            )
            .route("/api/containers/{id}/start", post(start_container))
            .route("/api/containers/{id}/stop", post(stop_container))
            .route("/api/containers/{id}/logs", get(container_logs))
            .route_layer(axum::middleware::from_fn(owner_middleware))
            // Unauthenticated routes (added after the layer).
            .route("/health", get(health_check))
            .with_state(state)
    }

    /// Serve the API until `shutdown` resolves.
    pub async fn serve(
        state: AppState,
        addr: std::net::SocketAddr,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Dashboard API listening on {}", addr);
        axum::serve(listener, Self::router(state))
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Resolve the caller's owner id from [`OWNER_HEADER`].
async fn owner_middleware(mut req: Request, next: Next) -> Response {
    let owner = req
        .headers()
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(OwnerId::new);

    match owner {
        Some(owner) => {
            req.extensions_mut().insert(owner);
            next.run(req).await
        }
        None => error_body(StatusCode::UNAUTHORIZED, "missing owner identity".to_string()),
    }
}

/// Maps orchestrator errors onto HTTP responses.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidTransition { .. } | OrchestratorError::Conflict { .. } => {
                StatusCode::CONFLICT
            }
            OrchestratorError::ContainerLost { .. } => StatusCode::GONE,
            OrchestratorError::SpecInvalid { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::EngineUnavailable { .. }
            | OrchestratorError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }

        let mut response = error_body(status, self.0.to_string());
        if let OrchestratorError::ResourceExhausted { retry_after, .. } = &self.0
            && let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn action_response(
    state: &AppState,
    outcome: Outcome,
    committed: StatusCode,
) -> (StatusCode, Json<ActionResponse>) {
    let pending = outcome.is_pending();
    let record = outcome.into_record();
    let url = state.orchestrator.url_for(&record);
    let status = if pending { StatusCode::ACCEPTED } else { committed };
    (
        status,
        Json(ActionResponse {
            record: RecordSummary::from(&record),
            url,
            pending,
        }),
    )
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

async fn list_containers(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
) -> Result<Json<Vec<ContainerStatusView>>, ApiError> {
    Ok(Json(state.status.list(&owner).await?))
}

async fn create_container(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<ActionResponse>), ApiError> {
    let outcome = state.orchestrator.request_create(&owner, req).await?;
    Ok(action_response(&state, outcome, StatusCode::CREATED))
}

async fn get_container(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContainerStatusView>, ApiError> {
    Ok(Json(state.status.get(&owner, id).await?))
}

async fn start_container(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ActionResponse>), ApiError> {
    let outcome = state.orchestrator.request_start(&owner, id).await?;
    Ok(action_response(&state, outcome, StatusCode::OK))
}

async fn stop_container(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ActionResponse>), ApiError> {
    let outcome = state.orchestrator.request_stop(&owner, id).await?;
    Ok(action_response(&state, outcome, StatusCode::OK))
}

async fn delete_container(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ActionResponse>), ApiError> {
    let outcome = state.orchestrator.request_delete(&owner, id).await?;
    Ok(action_response(&state, outcome, StatusCode::OK))
}

async fn container_logs(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL).min(MAX_LOG_TAIL);
    let logs = state.status.logs(&owner, id, tail).await?;
    Ok(Json(LogsResponse { record_id: id, logs }))
}
