//! Liveness endpoint with a snapshot of the delivery settings in force.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health — Process is up. Does not touch the database.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let policy = state.dispatcher.policy();

    Json(json!({
        "status": "ok",
        "service": "herald-api",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": state.config.queue_name,
        "delivery": {
            "maxAttempts": policy.max_attempts(),
            "backoffMs": policy.backoff_base().as_millis() as u64,
        },
        "database": {
            "connections": state.pool.size(),
            "idle": state.pool.num_idle(),
        }
    }))
}
