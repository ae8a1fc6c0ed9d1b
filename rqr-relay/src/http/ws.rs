//! WebSocket upgrade endpoint.

use crate::server::Relay;
use crate::signaling::Connection;
use axum::extract::WebSocketUpgrade;
use axum::response::Response;
use axum::Extension;
use std::sync::Arc;

/// Upgrade to a signaling connection.
pub async fn ws_handler(ws: WebSocketUpgrade, Extension(relay): Extension<Arc<Relay>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        Connection::new(relay).run(socket).await;
    })
}
