use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use ems_gateway::Actor;
use ems_types::api::{Claims, SendMessageRequest, UnreadCountResponse};

use crate::auth::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
    /// Id of that same message; breaks ties between equal timestamps.
    pub before_id: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

/// POST /messages/to/{username}: same relay path as the gateway's
/// SendMessage, for clients without a live connection.
pub async fn send_message(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .hub
        .send_direct(&Actor::from(&claims), &username, &req.content, None)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /messages/with/{username}
pub async fn get_history(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .hub
        .history(&Actor::from(&claims), &username, query.limit, query.before, query.before_id)
        .await?;
    Ok(Json(messages))
}

/// GET /messages/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.hub.conversations(&Actor::from(&claims)).await?;
    Ok(Json(conversations))
}

/// GET /messages/unread-count
pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state.hub.unread_count(&Actor::from(&claims)).await?;
    Ok(Json(UnreadCountResponse { count }))
}

/// POST /messages/{message_id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state.hub.mark_read(&Actor::from(&claims), message_id).await?;
    Ok(Json(message))
}
