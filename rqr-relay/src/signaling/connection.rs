//! Per-connection signaling state machine.
//!
//! Each WebSocket gets a Connection that binds to one (code, role) pair,
//! relays hint frames from the hub and keeps the peer alive with pings.

use super::{ConnectionId, Outbox};
use crate::server::Relay;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use rqr_types::{AuthToken, ClientFrame, Role, ServerFrame, SessionCode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Connection state machine states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, no accepted subscription yet.
    Connected,
    /// Receiving hints for one role of one session.
    Subscribed {
        /// Session code.
        code: SessionCode,
        /// Role the connection holds.
        role: Role,
    },
    /// Torn down; nothing further is processed.
    Closed,
}

/// One signaling WebSocket.
pub struct Connection {
    relay: Arc<Relay>,
    id: ConnectionId,
    state: ConnectionState,
    /// Target of the first subscribe attempt; later attempts must match it.
    binding: Option<(SessionCode, Role)>,
    outbox: Outbox,
    rx: Option<mpsc::Receiver<ServerFrame>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// Register a new connection with the hub.
    pub fn new(relay: Arc<Relay>) -> Self {
        let (outbox, rx) = Outbox::channel(relay.config().signaling.outbound_queue_depth);
        let id = relay.hub().connection_opened();
        relay.metrics().ws_connections_total.fetch_add(1, Ordering::Relaxed);
        Self {
            relay,
            id,
            state: ConnectionState::Connected,
            binding: None,
            outbox,
            rx: Some(rx),
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Drive the socket until the peer leaves, misses a heartbeat or the
    /// relay shuts down.
    pub async fn run(mut self, socket: WebSocket) {
        let Some(mut outbound) = self.rx.take() else {
            return;
        };
        let (mut sink, mut stream) = socket.split();
        let mut shutdown = self.relay.hub().shutdown_signal();
        if *shutdown.borrow_and_update() {
            let _ = sink.send(Message::Close(None)).await;
            self.close();
            return;
        }

        let period = Duration::from_secs(self.relay.config().signaling.heartbeat_interval_secs);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut awaiting_pong = false;
        let evicted = self.outbox.eviction();
        tracing::debug!("Connection {} opened", self.id);

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            tracing::debug!("Connection {} read error: {}", self.id, e);
                            break;
                        }
                        None => break,
                    };
                    // Any traffic proves the peer is alive.
                    awaiting_pong = false;
                    match message {
                        Message::Text(text) => self.handle_text(&text),
                        Message::Close(_) => break,
                        Message::Binary(_) => {
                            tracing::debug!("Connection {} sent binary frame, ignoring", self.id);
                        }
                        Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
                Some(frame) = outbound.recv() => {
                    let text = match frame.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Failed to encode frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::debug!("Connection {} write error: {}", self.id, e);
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        tracing::info!("Connection {} missed heartbeat, closing", self.id);
                        break;
                    }
                    awaiting_pong = true;
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                _ = evicted.notified() => {
                    // Flush what the hub queued, ending with the expiry error.
                    while let Ok(frame) = outbound.try_recv() {
                        let Ok(text) = frame.to_text() else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    tracing::info!("Connection {} evicted, session expired", self.id);
                    break;
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.close();
    }

    /// Handle one text frame from the client.
    pub(crate) fn handle_text(&mut self, text: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        match ClientFrame::from_text(text) {
            Ok(ClientFrame::Subscribe { code, role, token }) => {
                self.handle_subscribe(code, role, token)
            }
            Ok(ClientFrame::Ping) => self.send(ServerFrame::Pong),
            Ok(ClientFrame::Unknown) => {
                tracing::debug!("Connection {} sent unknown frame type", self.id);
            }
            Err(e) => {
                tracing::debug!("Connection {} sent malformed frame: {}", self.id, e);
                self.send(ServerFrame::error("Invalid message format"));
            }
        }
    }

    fn handle_subscribe(&mut self, code: SessionCode, role: Role, token: AuthToken) {
        if let Some((bound_code, bound_role)) = &self.binding {
            if *bound_code != code || *bound_role != role {
                self.send(ServerFrame::error(format!(
                    "Connection is bound to {bound_code} as {bound_role}"
                )));
                return;
            }
        }
        self.binding = Some((code.clone(), role));

        match self
            .relay
            .hub()
            .subscribe(self.id, &self.outbox, &code, role, &token)
        {
            Ok(()) => {
                tracing::info!("Connection {} subscribed to {} as {}", self.id, code, role);
                self.state = ConnectionState::Subscribed { code, role };
            }
            Err(e) => {
                self.relay
                    .metrics()
                    .auth_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Connection {} subscribe rejected: {}", self.id, e);
                self.send(ServerFrame::error("Invalid or expired token"));
            }
        }
    }

    fn send(&self, frame: ServerFrame) {
        self.outbox.send(frame);
    }

    /// Leave the hub. Runs once; later calls do nothing.
    fn close(&mut self) {
        match std::mem::replace(&mut self.state, ConnectionState::Closed) {
            ConnectionState::Closed => return,
            ConnectionState::Subscribed { code, role } => {
                self.relay.hub().unsubscribe(self.id, &code, role);
            }
            ConnectionState::Connected => {}
        }
        self.relay.hub().connection_closed();
        tracing::debug!("Connection {} closed", self.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use tempfile::TempDir;

    fn relay() -> (TempDir, Arc<Relay>) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.upload_dir = dir.path().join("uploads");
        (dir, Arc::new(Relay::new(config).unwrap()))
    }

    fn frames(conn: &mut Connection) -> Vec<ServerFrame> {
        let rx = conn.rx.as_mut().unwrap();
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn subscribe_text(code: &SessionCode, role: &str, token: &AuthToken) -> String {
        json!({
            "type": "subscribe",
            "code": code.as_str(),
            "role": role,
            "token": token.expose(),
        })
        .to_string()
    }

    #[test]
    fn valid_subscribe_moves_to_subscribed() {
        let (_dir, relay) = relay();
        let ticket = relay.create_session(None).unwrap();
        let mut conn = Connection::new(relay.clone());

        conn.handle_text(&subscribe_text(&ticket.code, "receiver", &ticket.receiver_token));

        assert_eq!(
            conn.state(),
            &ConnectionState::Subscribed {
                code: ticket.code.clone(),
                role: Role::Receiver
            }
        );
        assert!(matches!(
            frames(&mut conn).first(),
            Some(ServerFrame::Subscribed { .. })
        ));
    }

    #[test]
    fn invalid_token_gets_error_and_stays_connected() {
        let (_dir, relay) = relay();
        let ticket = relay.create_session(None).unwrap();
        let mut conn = Connection::new(relay.clone());

        conn.handle_text(&subscribe_text(&ticket.code, "receiver", &AuthToken::random()));

        assert_eq!(conn.state(), &ConnectionState::Connected);
        assert_eq!(
            frames(&mut conn),
            vec![ServerFrame::error("Invalid or expired token")]
        );
        assert_eq!(relay.metrics().auth_failures.load(Ordering::Relaxed), 1);
        assert_eq!(relay.hub().subscriber_count(&ticket.code, Role::Receiver), 0);
    }

    #[test]
    fn connection_is_bound_to_first_target() {
        let (_dir, relay) = relay();
        let first = relay.create_session(None).unwrap();
        let second = relay.create_session(None).unwrap();
        let mut conn = Connection::new(relay.clone());

        // Even a rejected attempt fixes the binding.
        conn.handle_text(&subscribe_text(&first.code, "receiver", &AuthToken::random()));
        conn.handle_text(&subscribe_text(&second.code, "receiver", &second.receiver_token));

        assert_eq!(conn.state(), &ConnectionState::Connected);
        let received = frames(&mut conn);
        assert!(matches!(&received[1], ServerFrame::Error { message } if message.contains("bound")));

        conn.handle_text(&subscribe_text(&first.code, "receiver", &first.receiver_token));
        assert!(matches!(conn.state(), ConnectionState::Subscribed { .. }));
    }

    #[test]
    fn ping_unknown_and_malformed_frames() {
        let (_dir, relay) = relay();
        let mut conn = Connection::new(relay);

        conn.handle_text(r#"{"type":"ping"}"#);
        conn.handle_text(r#"{"type":"hello-from-the-future","x":1}"#);
        conn.handle_text("not json");

        assert_eq!(
            frames(&mut conn),
            vec![
                ServerFrame::Pong,
                ServerFrame::error("Invalid message format")
            ]
        );
    }

    #[test]
    fn dropping_sender_connection_releases_slot() {
        let (_dir, relay) = relay();
        let ticket = relay.create_session(None).unwrap();
        let joined = relay.join_session(&ticket.code, None).unwrap();

        let mut conn = Connection::new(relay.clone());
        conn.handle_text(&subscribe_text(&ticket.code, "sender", &joined.sender_token));
        assert_eq!(relay.hub().connection_count(), 1);
        assert!(relay.join_session(&ticket.code, None).is_err());

        drop(conn);

        assert_eq!(relay.hub().connection_count(), 0);
        assert!(relay.join_session(&ticket.code, None).is_ok());
    }
}
