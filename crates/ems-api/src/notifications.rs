use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use ems_gateway::Actor;
use ems_types::api::{Claims, CreateNotificationRequest};

use crate::auth::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let views = state
        .hub
        .notifications(&Actor::from(&claims), query.limit)
        .await?;
    Ok(Json(views))
}

/// POST /notifications. Privileged roles only; fans out over the gateway.
pub async fn create_notification(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateNotificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let notification = state
        .hub
        .broadcast_notification(&Actor::from(&claims), req.kind, &req.title, &req.message)
        .await?;
    Ok((StatusCode::CREATED, Json(notification)))
}

pub async fn mark_notification_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .hub
        .mark_notification_read(&Actor::from(&claims), notification_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /presence
pub async fn get_presence(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
) -> impl IntoResponse {
    Json(state.hub.presence().await)
}
