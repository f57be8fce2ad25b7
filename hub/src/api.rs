use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppState;

/// Health check endpoint
pub async fn health_check(State(app_state): State<AppState>) -> impl IntoResponse {
    let state = app_state.hub.read().await;
    Json(json!({
        "status": "healthy",
        "sessions": state.sessions.len(),
        "connections": state.directory.connection_count(),
        "globalDevices": state.directory.len(),
        "uptime": app_state.start_time.elapsed().as_secs(),
    }))
}

/// Structured dump of sessions and global devices. Development only; the
/// route is not mounted in production.
pub async fn debug_dump(State(app_state): State<AppState>) -> impl IntoResponse {
    let state = app_state.hub.read().await;

    let sessions: Vec<_> = state
        .sessions
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "code": s.code,
                "createdBy": s.created_by,
                "createdAt": s.created_at.timestamp_millis(),
                "expiresAt": s.expires_at.timestamp_millis(),
                "devices": s.devices.values().collect::<Vec<_>>(),
                "groups": s.groups.values().collect::<Vec<_>>(),
            })
        })
        .collect();

    let devices: Vec<_> = state
        .directory
        .iter()
        .map(|e| {
            json!({
                "deviceId": e.device_id,
                "username": e.username,
                "name": e.name,
                "type": e.kind,
                "online": e.online,
                "lastSeen": e.last_seen.timestamp_millis(),
                "connections": e.connections.len(),
                "sessionId": e.session_id,
            })
        })
        .collect();

    Json(json!({
        "sessions": sessions,
        "globalDevices": devices,
    }))
}

/// WebSocket upgrade for client connections
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        app_state.hub.handle_socket(socket).await;
    })
}
