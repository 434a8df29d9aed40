//! JSON API over the engine. 128-bit quantities travel as decimal strings.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::agent::HeartbeatOutcome;
use crate::attack::AttackState;
use crate::engine::{AttackProgress, Engine};
use crate::error::{DispatchError, PlanningError};
use crate::lease::FencingToken;
use crate::planner::{parse_keyspace, KeyspaceParams, KeyspaceSource};
use crate::slice::{NoWorkReason, ResultSummary, SliceId, SliceRequest, SliceState, WorkSlice};
use crate::status::Ack;
use crate::{AgentId, AttackId, HashMode};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Error body: `{"error": ..., "kind": ...}`.
#[derive(Debug)]
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError(err)
    }
}

impl From<PlanningError> for ApiError {
    fn from(err: PlanningError) -> Self {
        ApiError(err.into())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            DispatchError::Planning(PlanningError::NotPlannable { .. }) => {
                (StatusCode::CONFLICT, "not_plannable")
            }
            DispatchError::Planning(_) => (StatusCode::UNPROCESSABLE_ENTITY, "planning"),
            DispatchError::LeaseConflict(_) => (StatusCode::CONFLICT, "lease_conflict"),
            DispatchError::StaleLease { .. } => (StatusCode::CONFLICT, "stale_lease"),
            DispatchError::SliceDead(_) => (StatusCode::CONFLICT, "slice_dead"),
            DispatchError::AttackNotFound(_) => (StatusCode::NOT_FOUND, "attack_not_found"),
            DispatchError::SliceNotFound(_) => (StatusCode::NOT_FOUND, "slice_not_found"),
            DispatchError::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
            DispatchError::InvalidSplit { .. } => (StatusCode::BAD_REQUEST, "invalid_split"),
            DispatchError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
            DispatchError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// Request bodies

/// Either a decimal total or the attack parameters to derive it from.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum KeyspaceBody {
    Total(String),
    Params(KeyspaceParams),
}

impl From<KeyspaceBody> for KeyspaceSource {
    fn from(body: KeyspaceBody) -> Self {
        match body {
            KeyspaceBody::Total(s) => KeyspaceSource::Decimal(s),
            KeyspaceBody::Params(p) => KeyspaceSource::Params(p),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub attack_id: AttackId,
    pub hash_mode: HashMode,
    pub keyspace: KeyspaceBody,
}

#[derive(Debug, Deserialize)]
pub struct ReplanRequest {
    pub keyspace: KeyspaceBody,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: AgentId,
    #[serde(default)]
    pub benchmarks: HashMap<HashMode, u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub benchmarks: HashMap<HashMode, u64>,
}

#[derive(Debug, Deserialize)]
pub struct SliceWanted {
    pub attack_ids: Vec<AttackId>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub lease_token: FencingToken,
    pub candidates_tested: String,
    pub rate: u64,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub lease_token: FencingToken,
    #[serde(default)]
    pub result: ResultSummary,
}

#[derive(Debug, Deserialize)]
pub struct FailureRequest {
    pub lease_token: FencingToken,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct SplitRequest {
    pub lease_token: FencingToken,
    #[serde(default)]
    pub at: Option<String>,
}

// Response bodies

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan_id: String,
}

#[derive(Debug, Serialize)]
pub struct SliceView {
    pub id: SliceId,
    pub start: String,
    pub end: String,
    pub state: SliceState,
    pub assigned_agent: Option<AgentId>,
    pub attempt_count: u32,
    pub candidates_tested: String,
    pub rate: u64,
    pub last_error: Option<String>,
    pub result: Option<ResultSummary>,
}

impl From<&WorkSlice> for SliceView {
    fn from(s: &WorkSlice) -> Self {
        Self {
            id: s.id,
            start: s.range.start.to_string(),
            end: s.range.end.to_string(),
            state: s.state,
            assigned_agent: s.assigned_agent,
            attempt_count: s.attempt_count,
            candidates_tested: s.candidates_tested.to_string(),
            rate: s.rate,
            last_error: s.last_error.clone(),
            result: s.result.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SliceResponse {
    Assigned {
        slice: SliceView,
        lease_token: FencingToken,
        lease_ttl_ms: u64,
    },
    NoWork {
        reason: String,
        retry_after_ms: Option<u64>,
    },
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl From<SliceRequest> for SliceResponse {
    fn from(request: SliceRequest) -> Self {
        match request {
            SliceRequest::Assigned(a) => SliceResponse::Assigned {
                slice: SliceView::from(&a.slice),
                lease_token: a.lease_token,
                lease_ttl_ms: millis(a.lease_ttl),
            },
            SliceRequest::NoWork(reason) => {
                let (reason, retry_after) = match reason {
                    NoWorkReason::BackingOff { retry_after } => {
                        ("backing_off".to_string(), Some(retry_after))
                    }
                    NoWorkReason::Throttled { retry_after } => {
                        ("throttled".to_string(), Some(retry_after))
                    }
                    NoWorkReason::UnknownAgent => ("unknown_agent".to_string(), None),
                    NoWorkReason::Ineligible(why) => (format!("ineligible: {}", why), None),
                    NoWorkReason::NothingPending => ("nothing_pending".to_string(), None),
                    NoWorkReason::Outranked => ("outranked".to_string(), None),
                    NoWorkReason::Contended => ("contended".to_string(), None),
                };
                SliceResponse::NoWork {
                    reason,
                    retry_after_ms: retry_after.map(millis),
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckResponse {
    Progress { lease_expires_in_ms: u64 },
    Completed { attack_completed: bool },
    Requeued { attempt_count: u32 },
    Dead { attempt_count: u32 },
}

impl From<Ack> for AckResponse {
    fn from(ack: Ack) -> Self {
        match ack {
            Ack::Progress { lease_expires_in } => AckResponse::Progress {
                lease_expires_in_ms: millis(lease_expires_in),
            },
            Ack::Completed { attack_completed } => AckResponse::Completed { attack_completed },
            Ack::Requeued { attempt_count } => AckResponse::Requeued { attempt_count },
            Ack::Dead { attempt_count } => AckResponse::Dead { attempt_count },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub attack_id: AttackId,
    pub state: AttackState,
    pub total_keyspace: String,
    pub keyspace_processed: String,
    pub percent_complete: f64,
    pub slices_by_state: BTreeMap<SliceState, usize>,
    pub dead_slices: Vec<SliceId>,
    pub dead_slice_count: usize,
    pub degraded: bool,
    pub aggregate_rate: u64,
    pub eta_secs: Option<u64>,
}

impl From<AttackProgress> for ProgressResponse {
    fn from(p: AttackProgress) -> Self {
        Self {
            attack_id: p.attack_id,
            state: p.state,
            total_keyspace: p.total_keyspace.to_string(),
            keyspace_processed: p.keyspace_processed.to_string(),
            percent_complete: p.percent_complete,
            dead_slice_count: p.dead_slice_count(),
            degraded: p.degraded(),
            slices_by_state: p.slices_by_state,
            dead_slices: p.dead_slices,
            aggregate_rate: p.aggregate_rate,
            eta_secs: p.eta.map(|d| d.as_secs()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SplitResponse {
    pub slice: SliceView,
    pub remainder: SliceView,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/plans", post(create_plan_handler))
        .route("/api/attacks/:attack_id/progress", get(progress_handler))
        .route("/api/attacks/:attack_id/slices", get(list_slices_handler))
        .route("/api/attacks/:attack_id/replan", post(replan_handler))
        .route("/api/attacks/:attack_id/pause", post(pause_handler))
        .route("/api/attacks/:attack_id/resume", post(resume_handler))
        .route("/api/attacks/:attack_id/cancel", post(cancel_handler))
        .route("/api/agents", post(register_agent_handler))
        .route("/api/agents/:agent_id/heartbeat", post(heartbeat_handler))
        .route("/api/agents/:agent_id/slices", post(request_slice_handler))
        .route(
            "/api/slices/:attack_id/:index/progress",
            post(report_progress_handler),
        )
        .route(
            "/api/slices/:attack_id/:index/complete",
            post(report_completion_handler),
        )
        .route(
            "/api/slices/:attack_id/:index/fail",
            post(report_failure_handler),
        )
        .route("/api/slices/:attack_id/:index/split", post(split_handler))
        .route("/api/slices/:attack_id/:index/revive", post(revive_handler))
        .route("/api/events", get(events_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` fires. Bind errors are logged, not fatal.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "API server failed");
    }
}

fn parse_u128(value: &str) -> Result<u128, ApiError> {
    Ok(parse_keyspace(value)?)
}

async fn create_plan_handler(
    State(state): State<ApiState>,
    Json(body): Json<CreatePlanRequest>,
) -> ApiResult<PlanResponse> {
    let plan_id = state
        .engine
        .create_task_plan(body.attack_id, body.keyspace, body.hash_mode)
        .await?;
    Ok(Json(PlanResponse {
        plan_id: plan_id.to_string(),
    }))
}

async fn replan_handler(
    State(state): State<ApiState>,
    Path(attack_id): Path<AttackId>,
    Json(body): Json<ReplanRequest>,
) -> ApiResult<PlanResponse> {
    let plan_id = state.engine.replan_attack(attack_id, body.keyspace).await?;
    Ok(Json(PlanResponse {
        plan_id: plan_id.to_string(),
    }))
}

async fn progress_handler(
    State(state): State<ApiState>,
    Path(attack_id): Path<AttackId>,
) -> ApiResult<ProgressResponse> {
    let progress = state.engine.get_attack_progress(attack_id).await?;
    Ok(Json(progress.into()))
}

async fn list_slices_handler(
    State(state): State<ApiState>,
    Path(attack_id): Path<AttackId>,
) -> ApiResult<Vec<SliceView>> {
    state.engine.stores().attacks.require(attack_id).await?;
    let slices = state.engine.slices(attack_id).await;
    Ok(Json(slices.iter().map(SliceView::from).collect()))
}

async fn pause_handler(
    State(state): State<ApiState>,
    Path(attack_id): Path<AttackId>,
) -> ApiResult<CountResponse> {
    let count = state.engine.pause_attack(attack_id).await?;
    Ok(Json(CountResponse { count }))
}

async fn resume_handler(
    State(state): State<ApiState>,
    Path(attack_id): Path<AttackId>,
) -> ApiResult<CountResponse> {
    let count = state.engine.resume_attack(attack_id).await?;
    Ok(Json(CountResponse { count }))
}

async fn cancel_handler(
    State(state): State<ApiState>,
    Path(attack_id): Path<AttackId>,
) -> ApiResult<CountResponse> {
    let count = state.engine.cancel_attack(attack_id).await?;
    Ok(Json(CountResponse { count }))
}

async fn register_agent_handler(
    State(state): State<ApiState>,
    Json(body): Json<RegisterAgentRequest>,
) -> StatusCode {
    state
        .engine
        .register_agent(body.agent_id, body.benchmarks)
        .await;
    StatusCode::NO_CONTENT
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Path(agent_id): Path<AgentId>,
    body: Option<Json<HeartbeatRequest>>,
) -> Json<HeartbeatResponse> {
    let benchmarks = body.map(|Json(b)| b.benchmarks).unwrap_or_default();
    let outcome = match state.engine.heartbeat(agent_id, benchmarks).await {
        HeartbeatOutcome::Registered => "registered",
        HeartbeatOutcome::Alive => "alive",
        HeartbeatOutcome::Reconnected => "reconnected",
    };
    Json(HeartbeatResponse { outcome })
}

async fn request_slice_handler(
    State(state): State<ApiState>,
    Path(agent_id): Path<AgentId>,
    Json(body): Json<SliceWanted>,
) -> ApiResult<SliceResponse> {
    let request = state
        .engine
        .request_slice(agent_id, &body.attack_ids)
        .await?;
    Ok(Json(request.into()))
}

async fn report_progress_handler(
    State(state): State<ApiState>,
    Path((attack_id, index)): Path<(AttackId, u32)>,
    Json(body): Json<ProgressRequest>,
) -> ApiResult<AckResponse> {
    let tested = parse_u128(&body.candidates_tested)?;
    let ack = state
        .engine
        .report_progress(
            body.lease_token,
            SliceId::new(attack_id, index),
            tested,
            body.rate,
        )
        .await?;
    Ok(Json(ack.into()))
}

async fn report_completion_handler(
    State(state): State<ApiState>,
    Path((attack_id, index)): Path<(AttackId, u32)>,
    Json(body): Json<CompletionRequest>,
) -> ApiResult<AckResponse> {
    let ack = state
        .engine
        .report_completion(body.lease_token, SliceId::new(attack_id, index), body.result)
        .await?;
    Ok(Json(ack.into()))
}

async fn report_failure_handler(
    State(state): State<ApiState>,
    Path((attack_id, index)): Path<(AttackId, u32)>,
    Json(body): Json<FailureRequest>,
) -> ApiResult<AckResponse> {
    let ack = state
        .engine
        .report_failure(body.lease_token, SliceId::new(attack_id, index), &body.reason)
        .await?;
    Ok(Json(ack.into()))
}

async fn split_handler(
    State(state): State<ApiState>,
    Path((attack_id, index)): Path<(AttackId, u32)>,
    Json(body): Json<SplitRequest>,
) -> ApiResult<SplitResponse> {
    let at = body.at.as_deref().map(parse_u128).transpose()?;
    let (slice, remainder) = state
        .engine
        .request_split(body.lease_token, SliceId::new(attack_id, index), at)
        .await?;
    Ok(Json(SplitResponse {
        slice: SliceView::from(&slice),
        remainder: SliceView::from(&remainder),
    }))
}

async fn revive_handler(
    State(state): State<ApiState>,
    Path((attack_id, index)): Path<(AttackId, u32)>,
) -> ApiResult<SliceView> {
    let slice = state
        .engine
        .revive_slice(SliceId::new(attack_id, index))
        .await?;
    Ok(Json(SliceView::from(&slice)))
}

/// Engine events as server-sent events. Lagging clients skip what they
/// missed.
async fn events_handler(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.engine.subscribe()).filter_map(|msg| match msg {
        Ok(event) => match Event::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "Event stream lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
