//! Admin routes: trigger a notification, manage templates, inspect delivery
//! progress.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use herald_common::error::AppError;
use herald_common::types::{StatusCount, Template};
use herald_engine::dispatcher::TriggerRequest;
use herald_engine::reporting::{ActivityPage, ActivityQuery, ReportingService};
use herald_engine::templates::{CreateTemplateParams, TemplateService};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/trigger", post(trigger_notification))
        .route("/admin/templates", post(create_template).get(list_templates))
        .route("/admin/metrics", get(delivery_metrics))
        .route("/admin/activity", get(delivery_activity))
}

/// Malformed JSON is a client error like any other invalid payload.
fn invalid_payload(rejection: JsonRejection) -> AppError {
    tracing::debug!(error = %rejection, "Rejected request body");
    AppError::Validation("Invalid payload".to_string())
}

/// POST /admin/trigger — Dispatch a template to a set of users.
async fn trigger_notification(
    State(state): State<AppState>,
    payload: Result<Json<TriggerRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(request) = payload.map_err(invalid_payload)?;
    let receipt = state.dispatcher.dispatch(request).await?;

    Ok(Json(json!({
        "success": true,
        "notificationId": receipt.notification_id
    })))
}

/// POST /admin/templates — Create a template.
async fn create_template(
    State(state): State<AppState>,
    payload: Result<Json<CreateTemplateParams>, JsonRejection>,
) -> Result<Json<Template>, AppError> {
    let Json(params) = payload.map_err(invalid_payload)?;
    let template = TemplateService::create(&state.pool, &params).await?;
    Ok(Json(template))
}

/// GET /admin/templates — All templates ordered by id.
async fn list_templates(State(state): State<AppState>) -> Result<Json<Vec<Template>>, AppError> {
    let templates = TemplateService::list(&state.pool).await?;
    Ok(Json(templates))
}

/// GET /admin/metrics — Delivery counts per status.
async fn delivery_metrics(
    State(state): State<AppState>,
) -> Result<Json<Vec<StatusCount>>, AppError> {
    let counts = ReportingService::status_counts(&state.pool).await?;
    Ok(Json(counts))
}

/// GET /admin/activity?page=&limit= — Paginated delivery log, newest first.
async fn delivery_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<ActivityPage>, AppError> {
    let page = ReportingService::activity(&state.pool, query).await?;
    Ok(Json(page))
}
