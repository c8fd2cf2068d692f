use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::error::ApiError;
use crate::extractors::CurrentUser;
use crate::streaming::{run_connection, run_subscription};
use crate::AppState;

/// Bidirectional request multiplexer.
pub async fn connect(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if state.streams.is_shutting_down() {
        return Err(ApiError::Unavailable("server is draining".to_string()));
    }
    Ok(ws.on_upgrade(move |socket| run_connection(state, user, socket)))
}

/// Server-stream of change events.
pub async fn subscribe(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if state.streams.is_shutting_down() {
        return Err(ApiError::Unavailable("server is draining".to_string()));
    }
    Ok(ws.on_upgrade(move |socket| run_subscription(state, user, socket)))
}
