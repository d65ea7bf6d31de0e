use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::ws;

/// `GET /socket` - upgrade to the live messaging socket
pub async fn socket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let ingress = state.ingress.clone();
    let server_config = state.server_config.clone();
    let metrics = state.metrics.clone();

    ws.on_upgrade(move |socket| ws::handle_chat_socket(socket, ingress, server_config, metrics))
}
