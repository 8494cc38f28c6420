//! Health probe and the client-telemetry drain.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness plus a coarse pool summary.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let accounts = state.accounts.len().await;
    let distribution = state.selector.load_distribution().await;
    let eligible = distribution.iter().filter(|row| row.weight > 0).count();
    Json(json!({
        "status": "ok",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": accounts,
        "eligible_accounts": eligible,
    }))
}

/// POST /api/event_logging/batch — always ok; clients drain telemetry here
/// and must never see an error.
pub async fn event_logging() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
