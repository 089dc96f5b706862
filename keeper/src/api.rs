//! # Read API
//!
//! Builds the axum router that exposes the keeper's HTTP interface. The
//! API is strictly read-only: every mutation goes through the engine's
//! typed entry points, driven by the keeper loops or an operator tool,
//! never through HTTP.
//!
//! ## Endpoints
//!
//! | Method | Path              | Description                          |
//! |--------|-------------------|--------------------------------------|
//! | GET    | `/health`         | Liveness probe                       |
//! | GET    | `/status`         | Engine status summary                |
//! | GET    | `/vaults`         | All vault overviews                  |
//! | GET    | `/vaults/:id`     | One vault overview by hex id         |
//! | GET    | `/batches/:id`    | Batch by hex id                      |
//! | GET    | `/proposals`      | All settlement proposals             |
//! | GET    | `/events`         | Event records, `?since=` for a tail  |
//! | GET    | `/metrics`        | Prometheus text exposition           |

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cairn_gateways::Engine;
use cairn_protocol::ids::{BatchId, VaultId};

use crate::metrics::{metrics_handler, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone — everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The keeper's reported version string.
    pub version: String,
    /// When this keeper process started, for uptime reporting.
    pub started_at: DateTime<Utc>,
    /// The settlement engine. Interior locking; shared with the loops.
    pub engine: Arc<Engine>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
///
/// The returned router is ready to be served on the configured listener.
/// `/metrics` rides the same listener as the rest of the API; the keeper
/// is a single-port daemon.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::clone(&state.metrics));

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/vaults", get(vaults_handler))
        .route("/vaults/:id", get(vault_by_id_handler))
        .route("/batches/:id", get(batch_by_id_handler))
        .route("/proposals", get(proposals_handler))
        .route("/events", get(events_handler))
        .with_state(state)
        .merge(metrics_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Keeper software version.
    pub version: String,
    /// Network identifier (e.g., "local", "testnet", "mainnet").
    pub network: String,
    /// Number of registered assets.
    pub assets: usize,
    /// Number of registered vaults.
    pub vaults: usize,
    /// Number of vaults currently holding an open batch.
    pub open_batches: usize,
    /// Number of settlement proposals still pending.
    pub open_proposals: usize,
    /// Sequence of the latest event, 0 if none.
    pub latest_event: u64,
    /// Whether a journal is attached.
    pub journaled: bool,
    /// Seconds since this keeper process started.
    pub uptime_secs: u64,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// Query parameters for `GET /events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Return only records with sequence strictly greater than this.
    /// Defaults to 0, i.e. the full log.
    pub since: Option<u64>,
}

/// Generic error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the keeper is alive.
///
/// This is the liveness probe for orchestrators (k8s, systemd, etc.).
/// It intentionally does not check engine health — that belongs in
/// `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — returns the engine status summary plus keeper uptime.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.status();
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    let resp = StatusResponse {
        version: state.version.clone(),
        network: status.network.to_string(),
        assets: status.assets,
        vaults: status.vaults,
        open_batches: status.open_batches,
        open_proposals: status.open_proposals,
        latest_event: status.latest_event,
        journaled: status.journaled,
        uptime_secs: uptime,
        timestamp: Utc::now().to_rfc3339(),
    };
    Json(resp)
}

/// `GET /vaults` — returns the accounting overview of every vault.
async fn vaults_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.vault_overviews())
}

/// `GET /vaults/:id` — returns one vault overview by its hex-encoded id.
///
/// Returns 400 for a malformed id and 404 when no such vault exists.
async fn vault_by_id_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let vault: VaultId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            let err = ErrorResponse {
                error: format!("Invalid vault id: {}", id),
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(err).unwrap()),
            )
                .into_response();
        }
    };

    match state.engine.vault_overview(&vault) {
        Some(overview) => (
            StatusCode::OK,
            Json(serde_json::to_value(overview).unwrap()),
        )
            .into_response(),
        None => {
            let err = ErrorResponse {
                error: format!("Vault not found: {}", id),
            };
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::to_value(err).unwrap()),
            )
                .into_response()
        }
    }
}

/// `GET /batches/:id` — returns a settlement batch by its hex-encoded id.
///
/// Returns 400 for a malformed id and 404 when no such batch exists.
async fn batch_by_id_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let batch: BatchId = match id.parse() {
        Ok(b) => b,
        Err(_) => {
            let err = ErrorResponse {
                error: format!("Invalid batch id: {}", id),
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(err).unwrap()),
            )
                .into_response();
        }
    };

    match state.engine.batch(&batch) {
        Some(record) => (StatusCode::OK, Json(serde_json::to_value(record).unwrap())).into_response(),
        None => {
            let err = ErrorResponse {
                error: format!("Batch not found: {}", id),
            };
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::to_value(err).unwrap()),
            )
                .into_response()
        }
    }
}

/// `GET /proposals` — returns every settlement proposal the engine knows,
/// pending and resolved alike. Clients filter by `status`.
async fn proposals_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.proposals())
}

/// `GET /events?since=N` — returns event records with sequence > N.
///
/// Journal-backed when the engine has one attached, so a consumer can
/// tail the full history across keeper restarts; otherwise serves the
/// in-memory log.
async fn events_handler(
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.engine.events_since(query.since.unwrap_or(0)) {
        Ok(records) => (
            StatusCode::OK,
            Json(serde_json::to_value(records).unwrap()),
        )
            .into_response(),
        Err(e) => {
            let err = ErrorResponse {
                error: format!("Event log read failed: {}", e),
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::to_value(err).unwrap()),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
