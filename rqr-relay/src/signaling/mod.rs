//! WebSocket signaling.
//!
//! [`SignalingHub`] keeps, per session code, the connections subscribed to
//! each role and pushes hint frames to them. Message contents never travel
//! here; clients fetch them over HTTP after a hint.
//!
//! Session updates that produce a hint go through [`SignalingHub::publish`],
//! which holds the code's channel lock across the store update and the fan-out.
//! A subscribe therefore sees either the state before the update (and then the
//! live hint) or the state after it (and the catch-up frame), never both.
//!
//! Each subscriber is tagged with the [`SessionEpoch`] it was authorized for.
//! Once that session is gone, the subscriber is evicted and its connection
//! closed, even if the code has since been handed to a new session.
//!
//! [`Connection`] drives one socket: subscribe handshake, heartbeat and the
//! teardown that re-opens the sender slot.

mod connection;

pub use connection::{Connection, ConnectionState};

use crate::error::SessionResult;
use crate::session::{SessionEpoch, SessionSnapshot, SessionStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rqr_types::{AuthToken, MessageId, MessageKind, Role, ServerFrame, SessionCode};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

/// Identifier of one WebSocket connection.
pub type ConnectionId = u64;

/// Where the hub delivers frames for one connection.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerFrame>,
    evicted: Arc<Notify>,
}

impl Outbox {
    /// Create an outbox and the receiving end of its frame queue.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(depth);
        let outbox = Self {
            tx,
            evicted: Arc::new(Notify::new()),
        };
        (outbox, rx)
    }

    /// Queue a frame without waiting; a full or closed queue drops it.
    pub fn send(&self, frame: ServerFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!("Outbound queue full, dropping {:?}", frame);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Signal raised when the hub drops this connection's subscription.
    pub(crate) fn eviction(&self) -> Arc<Notify> {
        Arc::clone(&self.evicted)
    }

    fn evict(&self) {
        self.send(ServerFrame::error("Session expired"));
        // Stores a permit, so the connection sees it even if not yet waiting.
        self.evicted.notify_one();
    }
}

/// A frame for one role of a session, produced by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    role: Role,
    frame: ServerFrame,
}

impl Hint {
    /// Tell receivers the sender's key is available.
    pub fn sender_key(responder_public_key: &str) -> Self {
        Self {
            role: Role::Receiver,
            frame: ServerFrame::SenderKeyAvailable {
                responder_public_key: responder_public_key.to_string(),
            },
        }
    }

    /// Tell senders the receiver's key is available.
    pub fn receiver_key(initiator_public_key: &str) -> Self {
        Self {
            role: Role::Sender,
            frame: ServerFrame::ReceiverKeyAvailable {
                initiator_public_key: initiator_public_key.to_string(),
            },
        }
    }

    /// Tell receivers the mailbox grew.
    pub fn message(count: usize, message_id: MessageId, kind: MessageKind) -> Self {
        Self {
            role: Role::Receiver,
            frame: ServerFrame::MessageAvailable {
                count,
                message_id: Some(message_id),
                message_type: Some(kind),
            },
        }
    }
}

/// Result of a session update run through [`SignalingHub::publish`].
#[derive(Debug)]
pub struct Published<T> {
    /// Value returned by the update.
    pub value: T,
    /// Connections that accepted the hint.
    pub delivered: usize,
}

#[derive(Debug, Clone)]
struct Subscriber {
    connection: ConnectionId,
    role: Role,
    token: AuthToken,
    epoch: SessionEpoch,
    outbox: Outbox,
}

/// Fan-out registry of subscribed connections.
#[derive(Debug)]
pub struct SignalingHub {
    store: Arc<SessionStore>,
    channels: DashMap<SessionCode, Vec<Subscriber>>,
    next_connection_id: AtomicU64,
    live_connections: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

/// Frames that bring a late subscriber up to date.
fn catch_up_frames(snapshot: &SessionSnapshot, role: Role) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    match role {
        Role::Receiver => {
            if let Some(key) = snapshot.public_key(Role::Sender) {
                frames.push(ServerFrame::SenderKeyAvailable {
                    responder_public_key: key.to_string(),
                });
            }
            if snapshot.message_count > 0 {
                frames.push(ServerFrame::MessageAvailable {
                    count: snapshot.message_count,
                    message_id: snapshot.newest_message.map(|(id, _)| id),
                    message_type: snapshot.newest_message.map(|(_, kind)| kind),
                });
            }
        }
        Role::Sender => {
            if let Some(key) = snapshot.public_key(Role::Receiver) {
                frames.push(ServerFrame::ReceiverKeyAvailable {
                    initiator_public_key: key.to_string(),
                });
            }
        }
    }
    frames
}

/// Evict subscribers not authorized for the `live` session. Returns how many
/// were evicted.
fn evict_stale(
    code: &SessionCode,
    subscribers: &mut Vec<Subscriber>,
    live: Option<SessionEpoch>,
) -> usize {
    let before = subscribers.len();
    subscribers.retain(|s| {
        let current = live == Some(s.epoch);
        if !current {
            s.outbox.evict();
        }
        current
    });

    let evicted = before - subscribers.len();
    if evicted > 0 {
        tracing::info!(
            "Evicted {} subscribers of expired session {}",
            evicted,
            code
        );
    }
    evicted
}

fn fan_out(code: &SessionCode, subscribers: &[Subscriber], hint: &Hint) -> usize {
    let targets: Vec<&Subscriber> = subscribers.iter().filter(|s| s.role == hint.role).collect();
    let delivered = targets
        .iter()
        .filter(|s| s.outbox.send(hint.frame.clone()))
        .count();
    tracing::debug!(
        "Notified {}/{} {} subscribers of {}",
        delivered,
        targets.len(),
        hint.role,
        code
    );
    delivered
}

impl SignalingHub {
    /// Create a hub validating tokens against `store`.
    pub fn new(store: Arc<SessionStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            channels: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            live_connections: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Allocate an id for a new socket.
    pub fn connection_opened(&self) -> ConnectionId {
        self.live_connections.fetch_add(1, Ordering::Relaxed);
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Account for a closed socket.
    pub fn connection_closed(&self) {
        self.live_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Open sockets.
    pub fn connection_count(&self) -> usize {
        self.live_connections.load(Ordering::Relaxed)
    }

    /// Subscribe `connection` to `role` of `code`.
    ///
    /// On success `subscribed` is queued on `outbox`, followed by the events
    /// the subscriber missed: the peer's key if known and, for receivers, the
    /// mailbox state. The token check, registration and catch-up all happen
    /// under the channel lock. Subscribing again from the same connection
    /// replaces its entry.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        outbox: &Outbox,
        code: &SessionCode,
        role: Role,
        token: &AuthToken,
    ) -> SessionResult<()> {
        let entry = self.channels.entry(code.clone());
        let snapshot = self.store.authorize(code, role, token)?;

        let mut subscribers = entry.or_default();
        evict_stale(code, &mut subscribers, Some(snapshot.epoch));
        subscribers.retain(|s| s.connection != connection);
        subscribers.push(Subscriber {
            connection,
            role,
            token: token.clone(),
            epoch: snapshot.epoch,
            outbox: outbox.clone(),
        });

        outbox.send(ServerFrame::Subscribed {
            code: code.clone(),
            role,
        });
        for frame in catch_up_frames(&snapshot, role) {
            outbox.send(frame);
        }

        tracing::debug!(
            "Connection {} subscribed to {} as {} ({} subscribers)",
            connection,
            code,
            role,
            subscribers.len()
        );
        Ok(())
    }

    /// Remove `connection` from `code`.
    ///
    /// When a sender leaves and no other connection of the same sender epoch
    /// remains, the sender slot is released so a new sender can join.
    pub fn unsubscribe(&self, connection: ConnectionId, code: &SessionCode, role: Role) {
        let mut departed = None;
        let mut same_epoch_remaining = false;

        if let Entry::Occupied(mut entry) = self.channels.entry(code.clone()) {
            let subscribers = entry.get_mut();
            if let Some(index) = subscribers.iter().position(|s| s.connection == connection) {
                departed = Some(subscribers.remove(index));
            }
            if let Some(gone) = &departed {
                same_epoch_remaining = subscribers
                    .iter()
                    .any(|s| s.role == Role::Sender && s.token.ct_eq(&gone.token));
            }
            if subscribers.is_empty() {
                entry.remove();
            }
        }

        let Some(gone) = departed else {
            return;
        };
        tracing::debug!("Connection {} left {} ({})", connection, code, role);

        if gone.role == Role::Sender && !same_epoch_remaining {
            self.store.release_sender(code, &gone.token);
        }
    }

    /// Run a session update and deliver the hint it yields.
    ///
    /// `update` returns its value, the epoch of the session it touched and an
    /// optional hint. The channel lock for `code` is held from before the
    /// update until the hint is queued. Subscribers from an older session
    /// under the same code are evicted instead of notified.
    pub fn publish<T>(
        &self,
        code: &SessionCode,
        update: impl FnOnce(&SessionStore) -> SessionResult<(T, SessionEpoch, Option<Hint>)>,
    ) -> SessionResult<Published<T>> {
        let entry = self.channels.entry(code.clone());
        let (value, epoch, hint) = update(&self.store)?;

        let Entry::Occupied(mut occupied) = entry else {
            return Ok(Published {
                value,
                delivered: 0,
            });
        };
        let subscribers = occupied.get_mut();
        evict_stale(code, subscribers, Some(epoch));
        let delivered = hint
            .map(|hint| fan_out(code, subscribers, &hint))
            .unwrap_or(0);
        if subscribers.is_empty() {
            occupied.remove();
        }
        Ok(Published { value, delivered })
    }

    /// Evict subscribers whose session has expired or been replaced.
    ///
    /// Returns how many were evicted; their connections are told and closed.
    pub fn prune_expired(&self) -> usize {
        let mut evicted = 0;
        self.channels.retain(|code, subscribers| {
            evicted += evict_stale(code, subscribers, self.store.current_epoch(code));
            !subscribers.is_empty()
        });
        evicted
    }

    /// Subscribers of `code` holding `role`.
    pub fn subscriber_count(&self, code: &SessionCode, role: Role) -> usize {
        self.channels
            .get(code)
            .map(|subscribers| subscribers.iter().filter(|s| s.role == role).count())
            .unwrap_or(0)
    }

    /// Receiver side of the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every connection to close.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        tracing::info!(
            "Closing {} signaling connections",
            self.connection_count()
        );
    }

    pub(crate) fn store(&self) -> &SessionStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use rqr_types::MessagePayload;
    use std::time::Duration;

    fn hub() -> SignalingHub {
        SignalingHub::new(Arc::new(SessionStore::new(Duration::from_secs(60))))
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn join(hub: &SignalingHub, code: &SessionCode, key: &str) -> Published<crate::session::JoinTicket> {
        hub.publish(code, |store| {
            let ticket = store.join_session(code, Some(key.to_string()))?;
            let epoch = ticket.epoch;
            Ok((ticket, epoch, Some(Hint::sender_key(key))))
        })
        .unwrap()
    }

    #[test]
    fn bad_token_is_never_subscribed() {
        let hub = hub();
        let ticket = hub.store().create_session(None).unwrap();
        let (outbox, mut rx) = Outbox::channel(8);

        let err = hub
            .subscribe(1, &outbox, &ticket.code, Role::Receiver, &AuthToken::random())
            .unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized { .. }));
        assert_eq!(hub.subscriber_count(&ticket.code, Role::Receiver), 0);

        join(&hub, &ticket.code, "04bb");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn subscribe_acknowledges_then_receives_hints() {
        let hub = hub();
        let ticket = hub.store().create_session(None).unwrap();
        let (outbox, mut rx) = Outbox::channel(8);

        hub.subscribe(1, &outbox, &ticket.code, Role::Receiver, &ticket.receiver_token)
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![ServerFrame::Subscribed {
                code: ticket.code.clone(),
                role: Role::Receiver
            }]
        );

        assert_eq!(join(&hub, &ticket.code, "04bb").delivered, 1);
        // Senders are a separate audience.
        let published = hub
            .publish(&ticket.code, |store| {
                let epoch = store.set_receiver_key(&ticket.code, &ticket.receiver_token, "04aa".into())?;
                Ok(((), epoch, Some(Hint::receiver_key("04aa"))))
            })
            .unwrap();
        assert_eq!(published.delivered, 0);
        assert_eq!(
            drain(&mut rx),
            vec![ServerFrame::SenderKeyAvailable {
                responder_public_key: "04bb".into()
            }]
        );
    }

    #[test]
    fn late_receiver_catches_up() {
        let hub = hub();
        let ticket = hub.store().create_session(None).unwrap();
        hub.store()
            .join_session(&ticket.code, Some("04bb".into()))
            .unwrap();
        let appended = hub
            .store()
            .store_message(&ticket.code, MessagePayload::Text(Default::default()))
            .unwrap();

        let (outbox, mut rx) = Outbox::channel(8);
        hub.subscribe(1, &outbox, &ticket.code, Role::Receiver, &ticket.receiver_token)
            .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[1],
            ServerFrame::SenderKeyAvailable {
                responder_public_key: "04bb".into()
            }
        );
        assert_eq!(
            frames[2],
            ServerFrame::MessageAvailable {
                count: 1,
                message_id: Some(appended.message.message_id),
                message_type: Some(MessageKind::Text),
            }
        );
    }

    #[test]
    fn late_sender_learns_receiver_key() {
        let hub = hub();
        let ticket = hub.store().create_session(Some("04aa".into())).unwrap();
        let joined = hub.store().join_session(&ticket.code, None).unwrap();

        let (outbox, mut rx) = Outbox::channel(8);
        hub.subscribe(7, &outbox, &ticket.code, Role::Sender, &joined.sender_token)
            .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(
            frames.last(),
            Some(&ServerFrame::ReceiverKeyAvailable {
                initiator_public_key: "04aa".into()
            })
        );
    }

    #[test]
    fn subscriber_sees_each_update_exactly_once() {
        let hub = Arc::new(hub());

        // Race a join against a subscribe many times: the receiver must end up
        // with exactly one sender-key-available, from catch-up or the push.
        for round in 0..200 {
            let ticket = hub.store().create_session(None).unwrap();
            let (outbox, mut rx) = Outbox::channel(8);

            let joiner = {
                let hub = Arc::clone(&hub);
                let code = ticket.code.clone();
                std::thread::spawn(move || {
                    join(&hub, &code, "04bb");
                })
            };
            hub.subscribe(round, &outbox, &ticket.code, Role::Receiver, &ticket.receiver_token)
                .unwrap();
            joiner.join().unwrap();

            let key_frames = drain(&mut rx)
                .into_iter()
                .filter(|f| matches!(f, ServerFrame::SenderKeyAvailable { .. }))
                .count();
            assert_eq!(key_frames, 1, "round {round}");
        }
    }

    #[test]
    fn subscriber_of_expired_session_is_evicted_not_notified() {
        let hub = SignalingHub::new(Arc::new(SessionStore::new(Duration::from_millis(100))));
        let old = hub.store().create_session(None).unwrap();
        let (outbox, mut rx) = Outbox::channel(8);
        let evicted = outbox.eviction();
        hub.subscribe(1, &outbox, &old.code, Role::Receiver, &old.receiver_token)
            .unwrap();
        drain(&mut rx);

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(hub.store().sweep_expired(), 1);

        // The generator may hand the freed code to a new session.
        let replacement = hub.store().insert_at(old.code.clone(), None).unwrap();
        let joined = join(&hub, &replacement.code, "new-sender-key");

        assert_eq!(joined.delivered, 0);
        assert_eq!(drain(&mut rx), vec![ServerFrame::error("Session expired")]);
        assert_eq!(hub.subscriber_count(&old.code, Role::Receiver), 0);
        assert!(futures_util::FutureExt::now_or_never(evicted.notified()).is_some());
    }

    #[test]
    fn prune_evicts_subscribers_of_swept_sessions() {
        let hub = SignalingHub::new(Arc::new(SessionStore::new(Duration::from_millis(20))));
        let ticket = hub.store().create_session(None).unwrap();
        let (outbox, mut rx) = Outbox::channel(8);
        hub.subscribe(1, &outbox, &ticket.code, Role::Receiver, &ticket.receiver_token)
            .unwrap();
        drain(&mut rx);
        assert_eq!(hub.prune_expired(), 0);

        std::thread::sleep(Duration::from_millis(40));
        hub.store().sweep_expired();

        assert_eq!(hub.prune_expired(), 1);
        assert_eq!(hub.subscriber_count(&ticket.code, Role::Receiver), 0);
        assert_eq!(drain(&mut rx), vec![ServerFrame::error("Session expired")]);
    }

    #[test]
    fn resubscribe_replaces_entry() {
        let hub = hub();
        let ticket = hub.store().create_session(None).unwrap();
        let (outbox, _rx) = Outbox::channel(8);

        hub.subscribe(1, &outbox, &ticket.code, Role::Receiver, &ticket.receiver_token)
            .unwrap();
        hub.subscribe(1, &outbox, &ticket.code, Role::Receiver, &ticket.receiver_token)
            .unwrap();
        assert_eq!(hub.subscriber_count(&ticket.code, Role::Receiver), 1);
    }

    #[test]
    fn sender_unsubscribe_releases_slot() {
        let hub = hub();
        let ticket = hub.store().create_session(None).unwrap();
        let joined = hub.store().join_session(&ticket.code, None).unwrap();
        let (outbox, _rx) = Outbox::channel(8);

        hub.subscribe(1, &outbox, &ticket.code, Role::Sender, &joined.sender_token)
            .unwrap();
        hub.subscribe(2, &outbox, &ticket.code, Role::Sender, &joined.sender_token)
            .unwrap();

        // Another connection of the same sender is still open.
        hub.unsubscribe(1, &ticket.code, Role::Sender);
        assert!(hub.store().snapshot(&ticket.code).unwrap().sender_connected);

        hub.unsubscribe(2, &ticket.code, Role::Sender);
        assert!(!hub.store().snapshot(&ticket.code).unwrap().sender_connected);
        assert!(hub.store().join_session(&ticket.code, None).is_ok());
    }

    #[test]
    fn stale_sender_connection_does_not_release_new_sender() {
        let hub = hub();
        let ticket = hub.store().create_session(None).unwrap();
        let first = hub.store().join_session(&ticket.code, None).unwrap();
        let (outbox, _rx) = Outbox::channel(8);
        hub.subscribe(1, &outbox, &ticket.code, Role::Sender, &first.sender_token)
            .unwrap();

        assert!(hub.store().release_sender(&ticket.code, &first.sender_token));
        hub.store().join_session(&ticket.code, None).unwrap();

        hub.unsubscribe(1, &ticket.code, Role::Sender);
        assert!(hub.store().snapshot(&ticket.code).unwrap().sender_connected);
    }

    #[test]
    fn full_queue_drops_frames_without_blocking() {
        let hub = hub();
        let ticket = hub.store().create_session(None).unwrap();
        let (outbox, mut rx) = Outbox::channel(1);

        hub.subscribe(1, &outbox, &ticket.code, Role::Receiver, &ticket.receiver_token)
            .unwrap();
        let message = |hub: &SignalingHub| {
            hub.publish(&ticket.code, |store| {
                let appended = store.store_message(&ticket.code, MessagePayload::Text(Default::default()))?;
                let hint = Hint::message(appended.count, appended.message.message_id, MessageKind::Text);
                Ok(((), appended.epoch, Some(hint)))
            })
            .unwrap()
            .delivered
        };
        assert_eq!(message(&hub), 0);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(message(&hub), 1);
    }

    #[test]
    fn shutdown_is_observed() {
        let hub = hub();
        let signal = hub.shutdown_signal();
        assert!(!*signal.borrow());
        hub.shutdown();
        assert!(*signal.borrow());
    }

    #[test]
    fn connection_counting() {
        let hub = hub();
        let a = hub.connection_opened();
        let b = hub.connection_opened();
        assert_ne!(a, b);
        assert_eq!(hub.connection_count(), 2);
        hub.connection_closed();
        assert_eq!(hub.connection_count(), 1);
    }
}
