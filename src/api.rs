//! REST API server for duochain
//!
//! Exposes the chain, data submission, remote-chain reconciliation, the
//! validator registry and round status over HTTP.

use axum::{
    extract::{Path, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::blockchain::{AdmissionPolicy, Block};
use crate::consensus::ForkDecision;
use crate::error::ChainError;
use crate::ledger::{parse_payload, Ledger};
use crate::node::NodeState;
use crate::shutdown::Shutdown;
use crate::staking::Announcement;
use crate::sync::ChainSynchronizer;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct ApiNode {
    pub ledger: Ledger,
    pub sync: Option<Arc<ChainSynchronizer>>,
    // Optional orchestrator state for health checks and logging
    pub state: Option<Arc<RwLock<NodeState>>>,
    shutdown: Shutdown,
    blocks_mined: Arc<AtomicU64>,
    api_stats: Arc<RwLock<ApiStats>>,
}

/// API statistics and monitoring
#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    data_submissions: u64,
    start_time: Option<Instant>,
}

impl ApiStats {
    fn new() -> Self {
        ApiStats {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn record_request(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }
}

impl ApiNode {
    /// Standalone API state over a ledger, with no peers or orchestrator.
    pub fn new(ledger: Ledger) -> Self {
        Self::new_shared(ledger, None, None, Shutdown::new())
    }

    pub fn new_shared(
        ledger: Ledger,
        sync: Option<Arc<ChainSynchronizer>>,
        state: Option<Arc<RwLock<NodeState>>>,
        shutdown: Shutdown,
    ) -> Self {
        ApiNode {
            ledger,
            sync,
            state,
            shutdown,
            blocks_mined: Arc::new(AtomicU64::new(0)),
            api_stats: Arc::new(RwLock::new(ApiStats::new())),
        }
    }

    pub fn blocks_mined(&self) -> u64 {
        self.blocks_mined.load(Ordering::Relaxed)
    }

    /// Lower-case node state for request logs; "standalone" without an orchestrator.
    async fn state_label(&self) -> &'static str {
        let Some(state) = &self.state else {
            return "standalone";
        };
        match *state.read().await {
            NodeState::Booting => "booting",
            NodeState::Syncing => "syncing",
            NodeState::Ready => "ready",
            NodeState::Degraded => "degraded",
        }
    }

    async fn get_stats(&self) -> ApiStatsResponse {
        let stats = self.api_stats.read().await;
        ApiStatsResponse {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            data_submissions: stats.data_submissions,
            blocks_mined: self.blocks_mined(),
            uptime_seconds: stats.start_time.map_or(0, |t| t.elapsed().as_secs()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Ledger(ChainError),
    NotFound(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Ledger(e) => {
                let status = match &e {
                    ChainError::MalformedInput(_)
                    | ChainError::DeserializationFailure(_)
                    | ChainError::PolicyMismatch(_)
                    | ChainError::InvalidSeal(_) => StatusCode::BAD_REQUEST,
                    ChainError::UnknownValidator(_) => StatusCode::NOT_FOUND,
                    ChainError::ChainIntegrity(_) | ChainError::NoEligibleValidator => StatusCode::CONFLICT,
                    ChainError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                    ChainError::NetworkError(_) | ChainError::ConfigError(_) | ChainError::IoError(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Ledger(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// `payload` may be a JSON number or a numeric string.
#[derive(Debug, Deserialize)]
pub struct SubmitDataRequest {
    pub payload: serde_json::Value,
    #[serde(default, rename = "validatorId", alias = "validator_id")]
    pub validator_id: Option<String>,
}

impl SubmitDataRequest {
    fn payload(&self) -> Result<i64, ChainError> {
        match &self.payload {
            serde_json::Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| ChainError::MalformedInput(format!("payload {} is not an integer", n))),
            serde_json::Value::String(s) => parse_payload(s),
            other => Err(ChainError::MalformedInput(format!("payload {} is not a number", other))),
        }
    }
}

#[derive(Serialize)]
pub struct SubmitDataResponse {
    /// "appended" for a mined block, "queued" for a round candidate
    pub status: &'static str,
    pub block: Block,
}

#[derive(Serialize)]
pub struct ReconcileResponse {
    pub adopted: bool,
    pub local_len: usize,
    pub remote_len: usize,
}

impl From<ForkDecision> for ReconcileResponse {
    fn from(decision: ForkDecision) -> Self {
        match decision {
            ForkDecision::Adopted { previous_len, new_len } => ReconcileResponse {
                adopted: true,
                local_len: previous_len,
                remote_len: new_len,
            },
            ForkDecision::Kept { local_len, remote_len } => ReconcileResponse {
                adopted: false,
                local_len,
                remote_len,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterValidatorRequest {
    pub id: String,
    #[serde(default)]
    pub balance: u64,
}

#[derive(Debug, Deserialize)]
pub struct AdjustBalanceRequest {
    pub delta: i64,
}

#[derive(Serialize)]
pub struct ValidatorResponse {
    pub id: String,
    pub balance: u64,
}

#[derive(Serialize)]
pub struct RoundResponse {
    pub round: u64,
    pub pending_candidates: usize,
    pub last_announcement: Option<Announcement>,
}

#[derive(Serialize)]
struct ApiStatsResponse {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    data_submissions: u64,
    blocks_mined: u64,
    uptime_seconds: u64,
}

// ============================================================================
// Middleware
// ============================================================================

/// Counts every request in [`ApiStats`] and emits one `api.request` event
/// after the handler answers. Server errors are logged at warn.
async fn request_middleware(State(node): State<Arc<ApiNode>>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = format!("{} {}", req.method(), req.uri().path());

    let response = next.run(req).await;
    let status = response.status();
    node.api_stats.write().await.record_request(status.is_success());

    let elapsed_us = started.elapsed().as_micros() as u64;
    let node_state = node.state_label().await;
    if status.is_server_error() {
        tracing::warn!(%route, status = status.as_u16(), elapsed_us, node_state, "api.request");
    } else {
        tracing::info!(%route, status = status.as_u16(), elapsed_us, node_state, "api.request");
    }
    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints
pub fn build_api_router(node: Arc<ApiNode>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    let api_routes = Router::new()
        // Chain endpoints
        .route("/chain", get(get_chain).post(post_chain))
        .route("/chain/height", get(get_chain_height))
        .route("/block/:index", get(get_block_by_index))
        .route("/data", post(submit_data))
        // Stake endpoints
        .route("/validators", get(get_validators).post(register_validator))
        .route("/validators/:id", delete(remove_validator))
        .route("/validators/:id/adjust", post(adjust_validator))
        .route("/round", get(get_round))
        // Network & system endpoints
        .route("/peers", get(get_peers))
        .route("/health", get(health_check))
        .route("/stats", get(get_api_stats))
        .layer(middleware::from_fn_with_state(node.clone(), request_middleware))
        .with_state(node);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the API on `0.0.0.0:port` until shutdown is triggered.
pub async fn run_api_server(node: Arc<ApiNode>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = node.shutdown.clone();
    let app = build_api_router(node);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check(State(node): State<Arc<ApiNode>>) -> impl IntoResponse {
    let body = |status: &str, node_state: Option<String>| {
        Json(serde_json::json!({
            "status": status,
            "node_state": node_state,
            "consensus": node.ledger.policy().name(),
            "height": node.ledger.len(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    };

    match &node.state {
        Some(s) => {
            let state = s.read().await.clone();
            if state == NodeState::Ready {
                (StatusCode::OK, body("healthy", Some(format!("{:?}", state)))).into_response()
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, body("unhealthy", Some(format!("{:?}", state)))).into_response()
            }
        }
        // No orchestrator state available, assume healthy
        None => (StatusCode::OK, body("healthy", None)).into_response(),
    }
}

async fn get_chain(State(node): State<Arc<ApiNode>>) -> Json<Vec<Block>> {
    Json(node.ledger.current_chain())
}

async fn get_chain_height(State(node): State<Arc<ApiNode>>) -> Json<u64> {
    Json(node.ledger.len() as u64)
}

async fn get_block_by_index(
    State(node): State<Arc<ApiNode>>,
    Path(index): Path<u64>,
) -> Result<Json<Block>, ApiError> {
    node.ledger
        .block(index)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Block at index {} not found", index)))
}

async fn submit_data(
    State(node): State<Arc<ApiNode>>,
    Json(req): Json<SubmitDataRequest>,
) -> Result<(StatusCode, Json<SubmitDataResponse>), ApiError> {
    let payload = req.payload()?;
    node.api_stats.write().await.data_submissions += 1;

    match node.ledger.policy() {
        AdmissionPolicy::ProofOfWork { .. } => {
            let ledger = node.ledger.clone();
            let shutdown = node.shutdown.clone();
            // the nonce search is CPU-bound
            let block = tokio::task::spawn_blocking(move || {
                ledger.submit_data_with_abort(payload, None, || shutdown.is_triggered())
            })
            .await
            .map_err(|e| ApiError::InternalError(format!("Mining task failed: {}", e)))??;

            node.blocks_mined.fetch_add(1, Ordering::Relaxed);
            if let Some(sync) = &node.sync {
                sync.trigger();
            }
            Ok((StatusCode::CREATED, Json(SubmitDataResponse { status: "appended", block })))
        }
        AdmissionPolicy::ProofOfStake => {
            let block = node.ledger.submit_data(payload, req.validator_id.as_deref())?;
            Ok((StatusCode::ACCEPTED, Json(SubmitDataResponse { status: "queued", block })))
        }
    }
}

/// Offer a full chain to this node, as a peer would.
async fn post_chain(State(node): State<Arc<ApiNode>>, body: String) -> Result<Json<ReconcileResponse>, ApiError> {
    let decision = node.ledger.receive_remote_chain(&body)?;
    if decision.is_adopted() {
        if let Some(sync) = &node.sync {
            sync.trigger();
        }
    }
    Ok(Json(decision.into()))
}

async fn get_validators(State(node): State<Arc<ApiNode>>) -> Json<Vec<ValidatorResponse>> {
    let mut validators: Vec<ValidatorResponse> = node
        .ledger
        .validators()
        .into_iter()
        .map(|(id, balance)| ValidatorResponse { id, balance })
        .collect();
    validators.sort_by(|a, b| a.id.cmp(&b.id));
    Json(validators)
}

async fn register_validator(
    State(node): State<Arc<ApiNode>>,
    Json(req): Json<RegisterValidatorRequest>,
) -> Result<(StatusCode, Json<ValidatorResponse>), ApiError> {
    node.ledger.register_validator(&req.id, req.balance)?;
    Ok((
        StatusCode::CREATED,
        Json(ValidatorResponse {
            id: req.id,
            balance: req.balance,
        }),
    ))
}

async fn adjust_validator(
    State(node): State<Arc<ApiNode>>,
    Path(id): Path<String>,
    Json(req): Json<AdjustBalanceRequest>,
) -> Result<Json<ValidatorResponse>, ApiError> {
    let balance = node.ledger.adjust_balance(&id, req.delta)?;
    Ok(Json(ValidatorResponse { id, balance }))
}

async fn remove_validator(
    State(node): State<Arc<ApiNode>>,
    Path(id): Path<String>,
) -> Result<Json<ValidatorResponse>, ApiError> {
    let balance = node.ledger.remove_validator(&id)?;
    Ok(Json(ValidatorResponse { id, balance }))
}

async fn get_round(State(node): State<Arc<ApiNode>>) -> Json<RoundResponse> {
    Json(RoundResponse {
        round: node.ledger.round(),
        pending_candidates: node.ledger.pending_candidates(),
        last_announcement: node.ledger.last_announcement(),
    })
}

async fn get_peers(State(node): State<Arc<ApiNode>>) -> impl IntoResponse {
    let peers = match &node.sync {
        Some(sync) => sync.peer_addrs().await,
        None => Vec::new(),
    };
    Json(serde_json::json!({
        "count": peers.len(),
        "peers": peers
    }))
}

async fn get_api_stats(State(node): State<Arc<ApiNode>>) -> impl IntoResponse {
    Json(node.get_stats().await)
}
