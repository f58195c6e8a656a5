use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;

/// Per-message cap. Route geometries are the largest payloads and stay
/// well under this.
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// GET /ws
/// WebSocket upgrade endpoint. Connections arrive anonymous; identity and
/// role are declared in-band via `registerRole` / `resumeSession`.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    actor::run_connection(socket, state).await;
}
