// ============================
// okean-backend-lib/src/ws_router.rs
// ============================
//! HTTP router: WebSocket upgrade and health check.
use crate::error::AppError;
use crate::validation;
use crate::websocket::handle_socket;
use crate::AppState;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use okean_common::GroupName;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Query string of `GET /ws`
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    /// Comma separated channel groups to join on connect
    pub groups: Option<String>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handler for WebSocket connections. The token is resolved before the
/// upgrade so unknown clients get a plain 401.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, AppError> {
    let token = params
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing token".to_string()))?;
    let user = state
        .identity
        .resolve(&token)
        .await?
        .ok_or_else(|| AppError::Unauthorized("unknown token".to_string()))?;
    let groups = parse_groups(params.groups.as_deref())?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    debug!(user_id = %user.id, groups = groups.len(), "upgrading connection");
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, user, groups))
        .into_response())
}

/// Split and validate the `groups` query parameter
pub fn parse_groups(raw: Option<&str>) -> Result<Vec<GroupName>, AppError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    let mut groups: Vec<GroupName> = Vec::new();
    for group in raw.split(',').map(str::trim).filter(|group| !group.is_empty()) {
        validation::validate_channel_group(group)?;
        if !groups.iter().any(|existing| existing == group) {
            groups.push(group.to_string());
        }
    }
    Ok(groups)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "online_users": state.relay.registry().online_count(),
        "connections": state.relay.connection_count(),
        "groups": state.relay.groups().group_count(),
        "active_calls": state.relay.calls().active_count(),
        "rooms": state.relay.rooms().room_count(),
    }))
}
