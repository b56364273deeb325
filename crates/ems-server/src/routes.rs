use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use ems_api::auth::{self, AppState, AppStateInner, verify_token};
use ems_api::middleware::require_auth;
use ems_api::{messages, notifications};
use ems_db::Database;
use ems_gateway::{Actor, Dispatcher, Hub, connection};

use crate::config::Config;

/// Wire the database, registry and hub into shared handler state.
pub fn build_state(config: &Config, db: Database) -> AppState {
    let db = Arc::new(db);
    let hub = Hub::new(db.clone(), Dispatcher::new());
    Arc::new(AppStateInner {
        db,
        hub,
        jwt_secret: config.jwt_secret.clone(),
        token_ttl_days: config.token_ttl_days,
        allow_role_signup: config.allow_role_signup,
    })
}

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/messages/conversations", get(messages::list_conversations))
        .route("/messages/unread-count", get(messages::unread_count))
        .route("/messages/with/{username}", get(messages::get_history))
        .route("/messages/to/{username}", post(messages::send_message))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route(
            "/notifications",
            get(notifications::list_notifications).post(notifications::create_notification),
        )
        .route("/notifications/{notification_id}/read", post(notifications::mark_notification_read))
        .route("/presence", get(notifications::get_presence))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// The bearer credential is checked before the upgrade; browsers that
/// cannot set headers on a WebSocket pass it as `?token=`.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = header_token.or(query.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let claims = match verify_token(&state.jwt_secret, &token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Gateway upgrade rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let actor = Actor::from(&claims);
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, hub, actor))
}
