//! User routes: the user directory and each user's notification list.

use axum::extract::{Path, State};
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde_json::json;

use herald_common::error::AppError;
use herald_common::types::{RenderedMessage, User};
use herald_engine::users::UserService;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user/all", get(list_users))
        .route("/user/notifications/{id}", get(list_notifications))
        .route("/user/notifications/{id}/read", patch(mark_read))
}

/// GET /user/all — Every user, ordered by name.
async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<User>>, AppError> {
    let users = UserService::list_users(&state.pool).await?;
    Ok(Json(users))
}

/// GET /user/notifications/:id — Rendered messages for a user, newest first.
async fn list_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<RenderedMessage>>, AppError> {
    let messages = UserService::notifications_for(&state.pool, user_id).await?;
    Ok(Json(messages))
}

/// PATCH /user/notifications/:id/read — Mark a message read.
async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    UserService::mark_read(&state.pool, id).await?;
    Ok(Json(json!({"success": true})))
}
