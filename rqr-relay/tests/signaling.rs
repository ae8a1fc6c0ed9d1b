//! End-to-end signaling tests against a live relay.
//!
//! Each test binds an ephemeral port, runs `serve` in the background and
//! talks to it with a real WebSocket client.

use futures_util::{SinkExt, StreamExt};
use reverseqr_relay::{serve, Config, Relay};
use rqr_types::{
    AuthToken, ClientFrame, MessageKind, MessagePayload, Role, ServerFrame, SessionCode,
    TextPayload,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestRelay {
    relay: Arc<Relay>,
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

impl TestRelay {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.upload_dir = dir.path().join("uploads");
        configure(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(Relay::new(config).unwrap());
        let (stop, stopped) = oneshot::channel::<()>();

        let server = Arc::clone(&relay);
        tokio::spawn(async move {
            serve(server, listener, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        });

        Self {
            relay,
            addr,
            stop: Some(stop),
            _dir: dir,
        }
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        ws
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn subscribe(ws: &mut Client, code: &SessionCode, role: Role, token: &AuthToken) {
    let frame = ClientFrame::Subscribe {
        code: code.clone(),
        role,
        token: token.clone(),
    };
    ws.send(Message::Text(frame.to_text().unwrap())).await.unwrap();
}

/// Next server frame, skipping transport-level pings.
async fn next_frame(ws: &mut Client) -> ServerFrame {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        match message {
            Message::Text(text) => return ServerFrame::from_text(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected message: {other:?}"),
        }
    }
}

/// True if no text frame arrives within `window`.
async fn stays_quiet(ws: &mut Client, window: Duration) -> bool {
    loop {
        match timeout(window, ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(_) => return false,
        }
    }
}

fn text_message() -> MessagePayload {
    MessagePayload::Text(TextPayload {
        ciphertext: "b3BhcXVl".into(),
        iv: "ab".repeat(12),
        ..Default::default()
    })
}

#[tokio::test]
async fn receiver_is_told_about_sender_key_and_messages() {
    let server = TestRelay::start().await;
    let ticket = server.relay.create_session(Some("04aa".into())).unwrap();

    let mut receiver = server.connect().await;
    subscribe(&mut receiver, &ticket.code, Role::Receiver, &ticket.receiver_token).await;
    assert_eq!(
        next_frame(&mut receiver).await,
        ServerFrame::Subscribed {
            code: ticket.code.clone(),
            role: Role::Receiver,
        }
    );

    server
        .relay
        .join_session(&ticket.code, Some("04bb".into()))
        .unwrap();
    assert_eq!(
        next_frame(&mut receiver).await,
        ServerFrame::SenderKeyAvailable {
            responder_public_key: "04bb".into(),
        }
    );

    let stored = server.relay.post_message(&ticket.code, text_message()).unwrap();
    assert_eq!(
        next_frame(&mut receiver).await,
        ServerFrame::MessageAvailable {
            count: 1,
            message_id: Some(stored.message_id),
            message_type: Some(MessageKind::Text),
        }
    );
}

#[tokio::test]
async fn late_receiver_catches_up() {
    let server = TestRelay::start().await;
    let ticket = server.relay.create_session(None).unwrap();
    server
        .relay
        .join_session(&ticket.code, Some("04bb".into()))
        .unwrap();
    let stored = server.relay.post_message(&ticket.code, text_message()).unwrap();

    let mut receiver = server.connect().await;
    subscribe(&mut receiver, &ticket.code, Role::Receiver, &ticket.receiver_token).await;

    assert!(matches!(
        next_frame(&mut receiver).await,
        ServerFrame::Subscribed { .. }
    ));
    assert_eq!(
        next_frame(&mut receiver).await,
        ServerFrame::SenderKeyAvailable {
            responder_public_key: "04bb".into(),
        }
    );
    assert_eq!(
        next_frame(&mut receiver).await,
        ServerFrame::MessageAvailable {
            count: 1,
            message_id: Some(stored.message_id),
            message_type: Some(MessageKind::Text),
        }
    );
}

#[tokio::test]
async fn bad_token_never_receives_hints() {
    let server = TestRelay::start().await;
    let ticket = server.relay.create_session(None).unwrap();

    let mut intruder = server.connect().await;
    subscribe(
        &mut intruder,
        &ticket.code,
        Role::Receiver,
        &AuthToken::new("not-the-token"),
    )
    .await;
    assert!(matches!(
        next_frame(&mut intruder).await,
        ServerFrame::Error { .. }
    ));
    assert_eq!(
        server.relay.hub().subscriber_count(&ticket.code, Role::Receiver),
        0
    );

    server
        .relay
        .join_session(&ticket.code, Some("04bb".into()))
        .unwrap();
    server.relay.post_message(&ticket.code, text_message()).unwrap();
    assert!(stays_quiet(&mut intruder, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn sender_receives_receiver_key() {
    let server = TestRelay::start().await;
    let ticket = server.relay.create_session(None).unwrap();
    let joined = server.relay.join_session(&ticket.code, None).unwrap();

    let mut sender = server.connect().await;
    subscribe(&mut sender, &ticket.code, Role::Sender, &joined.sender_token).await;
    assert!(matches!(
        next_frame(&mut sender).await,
        ServerFrame::Subscribed {
            role: Role::Sender,
            ..
        }
    ));

    server
        .relay
        .set_receiver_key(&ticket.code, &ticket.receiver_token, "04aa".into())
        .unwrap();
    assert_eq!(
        next_frame(&mut sender).await,
        ServerFrame::ReceiverKeyAvailable {
            initiator_public_key: "04aa".into(),
        }
    );
}

#[tokio::test]
async fn sender_disconnect_frees_the_slot() {
    let server = TestRelay::start().await;
    let ticket = server.relay.create_session(None).unwrap();
    let joined = server.relay.join_session(&ticket.code, None).unwrap();
    assert!(server.relay.join_session(&ticket.code, None).is_err());

    let mut sender = server.connect().await;
    subscribe(&mut sender, &ticket.code, Role::Sender, &joined.sender_token).await;
    assert!(matches!(
        next_frame(&mut sender).await,
        ServerFrame::Subscribed { .. }
    ));
    assert!(server.relay.join_session(&ticket.code, None).is_err());

    sender.close(None).await.unwrap();
    drop(sender);

    let rejoined = timeout(WAIT, async {
        loop {
            if let Ok(ticket) = server.relay.join_session(&ticket.code, None) {
                return ticket;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sender slot was not released");
    assert!(!rejoined.sender_token.ct_eq(&joined.sender_token));
}

#[tokio::test]
async fn ping_gets_pong_and_garbage_gets_error() {
    let server = TestRelay::start().await;
    let mut ws = server.connect().await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await, ServerFrame::Pong);

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::Error { .. }));

    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await, ServerFrame::Pong);
}

#[tokio::test]
async fn shutdown_closes_signaling_connections() {
    let mut server = TestRelay::start().await;
    let mut ws = server.connect().await;
    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await, ServerFrame::Pong);

    server.stop.take().unwrap().send(()).unwrap();

    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn silent_sender_is_reclaimed_by_heartbeat() {
    let server = TestRelay::start_with(|config| {
        config.signaling.heartbeat_interval_secs = 1;
    })
    .await;
    let ticket = server.relay.create_session(None).unwrap();
    let joined = server.relay.join_session(&ticket.code, None).unwrap();

    let mut sender = server.connect().await;
    subscribe(&mut sender, &ticket.code, Role::Sender, &joined.sender_token).await;
    assert!(matches!(
        next_frame(&mut sender).await,
        ServerFrame::Subscribed { .. }
    ));
    assert_eq!(server.relay.hub().connection_count(), 1);

    // The client stays connected but never reads again, so pings go unanswered.
    timeout(WAIT, async {
        while server.relay.hub().connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("unresponsive connection was not closed");

    assert_eq!(
        server.relay.hub().subscriber_count(&ticket.code, Role::Sender),
        0
    );
    assert!(server.relay.join_session(&ticket.code, None).is_ok());
    drop(sender);
}

#[tokio::test]
async fn subscriber_of_expired_session_is_closed() {
    let server = TestRelay::start_with(|config| {
        config.sessions.ttl_secs = 1;
        config.sessions.sweep_interval_secs = 1;
    })
    .await;
    let ticket = server.relay.create_session(None).unwrap();

    let mut receiver = server.connect().await;
    subscribe(&mut receiver, &ticket.code, Role::Receiver, &ticket.receiver_token).await;
    assert!(matches!(
        next_frame(&mut receiver).await,
        ServerFrame::Subscribed { .. }
    ));

    assert_eq!(
        next_frame(&mut receiver).await,
        ServerFrame::error("Session expired")
    );
    let closed = timeout(WAIT, async {
        loop {
            match receiver.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
