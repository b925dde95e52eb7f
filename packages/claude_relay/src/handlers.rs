//! HTTP routes: the WebSocket endpoint, project info, and static files.

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::path::Path;
use tower_http::services::ServeDir;

use crate::AppState;
use crate::ws;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInfo {
    pub cwd: String,
    pub project: String,
}

/// Routes served by the relay. Unmatched paths fall back to `public_dir`
/// when one is configured.
pub fn router(state: AppState, public_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/info", get(info_handler))
        .with_state(state);

    match public_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

pub async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.info.as_ref().clone())
}

pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, relay))
}
