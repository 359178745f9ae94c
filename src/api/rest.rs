// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// Endpoints live under `/api/v1/`. Health is public; everything else
// requires the X-Desktop-Token header. All administrative operations are
// idempotent: re-closing a closed key, re-resetting a breaker, and re-running
// sync are safe no-ops.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::DesktopToken;
use crate::app_state::AppState;
use crate::sync::reconcile_once;
use crate::types::StrategyCode;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/dashboard", get(dashboard))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/engines", get(engines))
        .route("/api/v1/close", post(manual_close))
        .route("/api/v1/sync", post(run_sync))
        .route("/api/v1/breaker/reset", post(breaker_reset))
        .route("/api/v1/throttle", get(throttle_status))
        .route("/api/v1/control/enable", post(control_enable))
        .route("/api/v1/control/disable", post(control_disable))
        .route("/api/v1/guided/suggest", post(guided_suggest))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Dashboard reads
// =============================================================================

async fn dashboard(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.dashboard_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            warn!(error = %e, "dashboard snapshot failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("{e}") })),
            )
                .into_response()
        }
    }
}

async fn positions(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.services.store.open_positions().await {
        Ok(open) => Json(open).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{e}") })),
        )
            .into_response(),
    }
}

async fn engines(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let statuses: Vec<_> = state.engines.iter().map(|e| e.status()).collect();
    Json(statuses)
}

// =============================================================================
// Manual close
// =============================================================================

#[derive(Deserialize)]
struct CloseRequest {
    market: String,
    strategy_code: String,
}

async fn manual_close(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CloseRequest>,
) -> impl IntoResponse {
    let code: StrategyCode = match req.strategy_code.parse() {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response();
        }
    };

    match state.services.manager.close_manual(&req.market, code).await {
        Ok(Some(closed)) => {
            info!(market = %req.market, strategy = %code, "manual close via API");
            Json(serde_json::json!({
                "closed": true,
                "position_id": closed.id,
                "realized_pnl": closed.realized_pnl,
                "exit_reason": closed.exit_reason,
            }))
            .into_response()
        }
        // Nothing open for the key — idempotent success.
        Ok(None) => Json(serde_json::json!({ "closed": false, "message": "no open position" }))
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{e}") })),
        )
            .into_response(),
    }
}

// =============================================================================
// Sync (reconcile)
// =============================================================================

async fn run_sync(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match reconcile_once(&state.services.client, &state.services.store).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            warn!(error = %e, "manual sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("{e}") })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Circuit breaker reset
// =============================================================================

#[derive(Deserialize)]
struct BreakerResetRequest {
    strategy_code: String,
}

async fn breaker_reset(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BreakerResetRequest>,
) -> impl IntoResponse {
    let code: StrategyCode = match req.strategy_code.parse() {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response();
        }
    };

    let known = state.services.breaker.reset(code);
    info!(strategy = %code, known, "circuit breaker reset via API");
    Json(serde_json::json!({ "strategy_code": code.as_str(), "reset": known })).into_response()
}

// =============================================================================
// Risk throttle query
// =============================================================================

#[derive(Deserialize)]
struct ThrottleQuery {
    market: String,
    strategy_code: String,
    #[serde(default)]
    force_refresh: bool,
}

async fn throttle_status(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThrottleQuery>,
) -> impl IntoResponse {
    let code: StrategyCode = match query.strategy_code.parse() {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response();
        }
    };

    match state
        .services
        .throttle
        .evaluate(&query.market, code, query.force_refresh)
        .await
    {
        Ok(throttle) => Json(throttle).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{e}") })),
        )
            .into_response(),
    }
}

// =============================================================================
// Control
// =============================================================================

async fn control_enable(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.services.coordinator.set_enabled(true);
    Json(serde_json::json!({ "enabled": true }))
}

async fn control_disable(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.services.coordinator.set_enabled(false);
    Json(serde_json::json!({ "enabled": false }))
}

// =============================================================================
// Guided suggestions
// =============================================================================

#[derive(Deserialize)]
struct GuidedSuggestRequest {
    market: String,
    #[serde(default)]
    note: String,
}

async fn guided_suggest(
    _auth: DesktopToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<GuidedSuggestRequest>,
) -> impl IntoResponse {
    state.guided.suggest(&req.market, &req.note);
    Json(serde_json::json!({
        "queued": req.market,
        "pending": state.guided.pending(),
    }))
}
