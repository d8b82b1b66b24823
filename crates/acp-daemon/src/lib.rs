// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP control-plane API for the Agent Control Plane.

/// SSE and WebSocket event stream endpoints.
pub mod stream;

use acp_approvals::{ApprovalError, BulkSelector};
use acp_core::{
    Approval, ApprovalStatus, Contract, EventType, ResolutionSource, RejectionReason, Run,
    RunState, TransitionRecord,
};
use acp_ledger::LedgerError;
use acp_runtime::{Orchestrator, OrchestratorError};
use axum::{
    Json, Router,
    extract::{Path as AxPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

/// Shared state for all handlers.
pub struct AppState {
    /// The orchestrator and, through it, every core service.
    pub orchestrator: Arc<Orchestrator>,
    /// Workspace used when a submission does not name one.
    pub default_workspace: String,
    /// Process start, for the health endpoint.
    pub started_at: std::time::Instant,
}

/// Structured API error with a status code, rendered as `{"error": …}`.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to return.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Create an error.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::RunUnknown(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            LedgerError::Transition(_) => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            LedgerError::Append(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::AdmissionFull(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            OrchestratorError::WrongState { .. } => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
            OrchestratorError::Ledger(inner) => inner.into(),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, e.to_string()),
            ApprovalError::Conflict(_) | ApprovalError::DuplicateCheckpoint(_) => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
            ApprovalError::InvalidRunState { .. } => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
            ApprovalError::Ledger(inner) => inner.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /runs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRunRequest {
    /// Workspace to run in; the daemon default when omitted.
    pub workspace_id: Option<String>,
    /// The contract to execute.
    pub contract: Contract,
}

/// A run document as served over the API: every ledger field plus the
/// computed total.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunDocument {
    /// The run as stored.
    #[serde(flatten)]
    pub run: Run,
    /// `compute_cents + api_cents`, computed at serialization time.
    pub total_cents: u64,
}

impl From<Run> for RunDocument {
    fn from(run: Run) -> Self {
        let total_cents = run.total_cents();
        Self { run, total_cents }
    }
}

/// Body of `POST /approvals/{id}/approve`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApproveRequest {
    /// Who approved.
    pub approver_id: String,
    /// Which surface the approval came from; `api` when omitted.
    pub source: Option<ResolutionSource>,
}

/// Body of `POST /approvals/{id}/reject`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RejectRequest {
    /// Why the checkpoint is rejected.
    pub reason: RejectionReason,
    /// Who rejected.
    pub rejector_id: Option<String>,
    /// Which surface the rejection came from; `api` when omitted.
    pub source: Option<ResolutionSource>,
}

/// Body of `POST /approvals/{id}/edit`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EditRequest {
    /// The edited preview payload.
    pub preview: serde_json::Value,
    /// Who edited.
    pub editor_id: Option<String>,
    /// Which surface the edit came from; `api` when omitted.
    pub source: Option<ResolutionSource>,
}

/// Response for approval resolutions.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResolutionResponse {
    /// The resolved checkpoint.
    pub checkpoint_id: String,
    /// Final status.
    pub status: ApprovalStatus,
    /// The run transition the resolution caused, when one was applied.
    pub transition: Option<TransitionRecord>,
}

/// Query for `GET /runs`.
#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    /// Filter by workspace.
    pub workspace_id: Option<String>,
    /// Filter by state.
    pub state: Option<RunState>,
    /// `view=kanban` returns the grouped board instead of a flat list.
    pub view: Option<String>,
}

/// Query for `GET /runs/{id}/events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Return events with `seq > after_seq`.
    pub after_seq: Option<i64>,
    /// Page size (default 100).
    pub limit: Option<usize>,
    /// Comma-separated event type filter.
    pub types: Option<String>,
}

/// Query for `GET /approvals`.
#[derive(Debug, Deserialize)]
pub struct ApprovalsQuery {
    /// Filter by run.
    pub run_id: Option<Uuid>,
    /// Filter by action type.
    pub action_type: Option<String>,
}

/// Body of `POST /approvals/bulk-approve`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkApproveRequest {
    /// Match checkpoints of this run.
    pub run_id: Option<Uuid>,
    /// Match checkpoints gating this action type.
    pub action_type: Option<String>,
    /// Who approved.
    pub approver_id: String,
}

pub(crate) fn parse_types(raw: Option<&str>) -> Result<Option<Vec<EventType>>, ApiError> {
    let Some(raw) = raw else { return Ok(None) };
    let mut types = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let t = EventType::from_str(part)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
        types.push(t);
    }
    Ok(if types.is_empty() { None } else { Some(types) })
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the Axum router with all control-plane routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/runs", post(cmd_create_run).get(cmd_list_runs))
        .route("/runs/{run_id}", get(cmd_get_run))
        .route("/runs/{run_id}/pause", post(cmd_pause_run))
        .route("/runs/{run_id}/resume", post(cmd_resume_run))
        .route("/runs/{run_id}/cancel", post(cmd_cancel_run))
        .route("/runs/{run_id}/events", get(cmd_run_events))
        .route("/runs/{run_id}/stream", get(stream::cmd_stream_sse))
        .route("/runs/{run_id}/ws", get(stream::cmd_stream_ws))
        .route("/approvals", get(cmd_list_approvals))
        .route("/approvals/bulk-approve", post(cmd_bulk_approve))
        .route("/approvals/{checkpoint_id}/approve", post(cmd_approve))
        .route("/approvals/{checkpoint_id}/reject", post(cmd_reject))
        .route("/approvals/{checkpoint_id}/edit", post(cmd_edit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "contract_version": acp_core::CONTRACT_VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "active_runs": state.orchestrator.active_runs(),
    }))
}

async fn cmd_create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Json<RunDocument>, ApiError> {
    let workspace = req
        .workspace_id
        .unwrap_or_else(|| state.default_workspace.clone());
    let run = state.orchestrator.submit(workspace, req.contract).await?;
    info!(target: "acp.daemon", run_id = %run.run_id, state = %run.state, "run submitted");
    Ok(Json(run.into()))
}

async fn cmd_get_run(
    AxPath(run_id): AxPath<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RunDocument>, ApiError> {
    let run = state.orchestrator.ledger().get_run(run_id).await?;
    Ok(Json(run.into()))
}

async fn cmd_list_runs(
    Query(query): Query<RunsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let ledger = state.orchestrator.ledger();

    if query.view.as_deref() == Some("kanban") {
        return Ok(Json(ledger.kanban_board().await).into_response());
    }

    let summaries = match (&query.workspace_id, query.state) {
        (Some(workspace), None) => ledger.list_by_workspace(workspace).await,
        (None, Some(run_state)) => ledger.list_by_state(run_state).await,
        (Some(workspace), Some(run_state)) => {
            let mut out = ledger.list_by_workspace(workspace).await;
            out.retain(|s| s.state == run_state);
            out
        }
        (None, None) => ledger.list_all().await,
    };
    Ok(Json(summaries).into_response())
}

async fn cmd_pause_run(
    AxPath(run_id): AxPath<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RunDocument>, ApiError> {
    let run = state.orchestrator.pause(run_id).await?;
    Ok(Json(run.into()))
}

async fn cmd_resume_run(
    AxPath(run_id): AxPath<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RunDocument>, ApiError> {
    let run = state.orchestrator.resume(run_id).await?;
    Ok(Json(run.into()))
}

async fn cmd_cancel_run(
    AxPath(run_id): AxPath<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RunDocument>, ApiError> {
    let run = state.orchestrator.cancel(run_id).await?;
    Ok(Json(run.into()))
}

async fn cmd_run_events(
    AxPath(run_id): AxPath<Uuid>,
    Query(query): Query<EventsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<acp_core::Event>>, ApiError> {
    let types = parse_types(query.types.as_deref())?;
    let events = state
        .orchestrator
        .ledger()
        .events()
        .list(
            run_id,
            query.after_seq,
            query.limit.unwrap_or(100),
            types.as_deref(),
        )
        .await
        .map_err(|e| ApiError::new(StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(events))
}

async fn cmd_list_approvals(
    Query(query): Query<ApprovalsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Approval>>, ApiError> {
    let pending = state
        .orchestrator
        .approvals()
        .list_pending(query.run_id, query.action_type.as_deref())
        .await;
    Ok(Json(pending))
}

async fn cmd_approve(
    AxPath(checkpoint_id): AxPath<String>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ResolutionResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .approvals()
        .approve(
            &checkpoint_id,
            &req.approver_id,
            req.source.unwrap_or(ResolutionSource::Api),
        )
        .await?;
    Ok(Json(ResolutionResponse {
        checkpoint_id,
        status: outcome.approval.status,
        transition: outcome.transition,
    }))
}

async fn cmd_reject(
    AxPath(checkpoint_id): AxPath<String>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<ResolutionResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .approvals()
        .reject(
            &checkpoint_id,
            req.reason,
            req.rejector_id.as_deref(),
            req.source.unwrap_or(ResolutionSource::Api),
        )
        .await?;
    Ok(Json(ResolutionResponse {
        checkpoint_id,
        status: outcome.approval.status,
        transition: outcome.transition,
    }))
}

async fn cmd_edit(
    AxPath(checkpoint_id): AxPath<String>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<EditRequest>,
) -> Result<Json<ResolutionResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .approvals()
        .edit(
            &checkpoint_id,
            req.preview,
            req.editor_id.as_deref(),
            req.source.unwrap_or(ResolutionSource::Api),
        )
        .await?;
    Ok(Json(ResolutionResponse {
        checkpoint_id,
        status: outcome.approval.status,
        transition: outcome.transition,
    }))
}

async fn cmd_bulk_approve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkApproveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcomes = state
        .orchestrator
        .approvals()
        .bulk_approve(
            &BulkSelector {
                run_id: req.run_id,
                action_type: req.action_type,
            },
            &req.approver_id,
        )
        .await;
    Ok(Json(json!({ "outcomes": outcomes })))
}
