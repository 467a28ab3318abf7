// MDM Entity Resolution - Web Server
// Read API over golden records and audit, plus steward decisions

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use mdm_resolution::{
    AuditEntry, ConflictedMerge, GoldenRecord, MatchDecision, PairKey, PendingReview, ResolutionConfig,
    ResolutionEngine, ResolutionError, SqliteAuditLog, SqliteStore, StewardVerdict,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type Engine = ResolutionEngine<SqliteStore, SqliteAuditLog>;

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<Engine>>,
}

#[derive(Parser)]
#[command(name = "mdm-server", about = "HTTP API for golden records and steward review")]
struct Args {
    /// SQLite database (records, clusters, golden records, audit log)
    #[arg(long, env = "MDM_DB", default_value = "mdm.db")]
    db: PathBuf,

    /// Resolution config (JSON); defaults when omitted
    #[arg(long, env = "MDM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "MDM_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

/// Error body with a status derived from the engine error
struct ApiError(StatusCode, String);

impl From<ResolutionError> for ApiError {
    fn from(err: ResolutionError) -> Self {
        let status = match &err {
            ResolutionError::NotFound(_) => StatusCode::NOT_FOUND,
            ResolutionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ResolutionError::AuditUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            success: false,
            data: (),
            error: Some(self.1),
        };
        (self.0, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Golden record with a link to its history
#[derive(Serialize)]
struct GoldenResponse {
    #[serde(flatten)]
    golden: GoldenRecord,
    history_url: String,
}

impl From<GoldenRecord> for GoldenResponse {
    fn from(golden: GoldenRecord) -> Self {
        let history_url = format!("/api/golden/{}/history", urlencoding::encode(&golden.golden_id));
        GoldenResponse { golden, history_url }
    }
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default)]
    since: u64,
}

#[derive(Deserialize)]
struct DecisionRequest {
    /// `a|b`
    pair: String,
    verdict: StewardVerdict,
    steward_id: String,
}

fn with_engine<T>(state: &AppState, f: impl FnOnce(&mut Engine) -> mdm_resolution::Result<T>) -> ApiResult<T> {
    let mut engine = state
        .engine
        .lock()
        .map_err(|_| ApiError(StatusCode::INTERNAL_SERVER_ERROR, "engine lock poisoned".to_string()))?;
    Ok(Json(ApiResponse::ok(f(&mut engine)?)))
}

fn decode(param: &str) -> String {
    urlencoding::decode(param)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| param.to_string())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/golden - Current version of every live golden record
async fn list_goldens(State(state): State<AppState>) -> ApiResult<Vec<GoldenResponse>> {
    with_engine(&state, |engine| {
        Ok(engine.current_goldens()?.into_iter().map(GoldenResponse::from).collect())
    })
}

/// GET /api/golden/:golden_id
async fn get_golden(State(state): State<AppState>, Path(golden_id): Path<String>) -> ApiResult<GoldenResponse> {
    let golden_id = decode(&golden_id);
    with_engine(&state, |engine| {
        engine
            .golden(&golden_id)?
            .map(GoldenResponse::from)
            .ok_or_else(|| ResolutionError::NotFound(format!("golden record {}", golden_id)))
    })
}

/// GET /api/golden/:golden_id/history - Every version, oldest first
async fn golden_history(State(state): State<AppState>, Path(golden_id): Path<String>) -> ApiResult<Vec<GoldenRecord>> {
    let golden_id = decode(&golden_id);
    with_engine(&state, |engine| {
        let history = engine.golden_history(&golden_id)?;
        if history.is_empty() {
            return Err(ResolutionError::NotFound(format!("golden record {}", golden_id)));
        }
        Ok(history)
    })
}

/// GET /api/records/:record_id/golden
async fn golden_for_record(State(state): State<AppState>, Path(record_id): Path<String>) -> ApiResult<GoldenResponse> {
    let record_id = decode(&record_id);
    with_engine(&state, |engine| {
        engine
            .golden_for_record(&record_id)?
            .map(GoldenResponse::from)
            .ok_or_else(|| ResolutionError::NotFound(format!("golden record for {}", record_id)))
    })
}

/// GET /api/audit?since=N - Entries with sequence > N
async fn audit_since(State(state): State<AppState>, Query(query): Query<AuditQuery>) -> ApiResult<Vec<AuditEntry>> {
    with_engine(&state, |engine| engine.audit_since(query.since))
}

/// GET /api/reviews
async fn list_reviews(State(state): State<AppState>) -> ApiResult<Vec<PendingReview>> {
    with_engine(&state, |engine| engine.pending_reviews())
}

/// GET /api/conflicts
async fn list_conflicts(State(state): State<AppState>) -> ApiResult<Vec<ConflictedMerge>> {
    with_engine(&state, |engine| engine.open_conflicts())
}

/// POST /api/reviews/decision - Steward verdict on a pending pair
async fn post_decision(State(state): State<AppState>, Json(request): Json<DecisionRequest>) -> ApiResult<MatchDecision> {
    let Some(pair) = PairKey::parse(&request.pair) else {
        return Err(ApiError(StatusCode::BAD_REQUEST, format!("bad pair '{}', expected a|b", request.pair)));
    };
    with_engine(&state, |engine| engine.decide(&pair, request.verdict, &request.steward_id))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ResolutionConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ResolutionConfig::default(),
    };

    let store = SqliteStore::open(&args.db).with_context(|| format!("Failed to open {}", args.db.display()))?;
    let audit = SqliteAuditLog::open(&args.db)?;
    let engine = ResolutionEngine::new(config, store, audit)?;
    info!("Database opened: {}", args.db.display());

    // Create shared state
    let state = AppState {
        engine: Arc::new(Mutex::new(engine)),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/golden", get(list_goldens))
        .route("/golden/:golden_id", get(get_golden))
        .route("/golden/:golden_id/history", get(golden_history))
        .route("/records/:record_id/golden", get(golden_for_record))
        .route("/audit", get(audit_since))
        .route("/reviews", get(list_reviews))
        .route("/reviews/decision", post(post_decision))
        .route("/conflicts", get(list_conflicts))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    info!("🚀 Server running on http://{}", args.addr);
    info!("   API: http://{}/api/golden", args.addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
