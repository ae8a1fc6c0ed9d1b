//! Session registry.
//!
//! [`SessionStore`] owns every pairing session: code allocation, expiry,
//! per-role tokens, the single-sender slot and the message mailbox.
//!
//! Sessions live in a `DashMap` keyed by code. Every mutation that must be
//! atomic (code check-and-insert, the sender slot compare-and-set, mailbox
//! append) runs while holding that entry's shard lock, so no two callers can
//! observe the same intermediate state.
//!
//! Expiry is absolute: `expires_at = created_at + ttl`, never extended by
//! activity. Reads evict expired entries lazily; [`SessionStore::sweep_expired`]
//! removes the ones nobody reads again.
//!
//! Every session carries a [`SessionEpoch`] that is never reused, so a code
//! handed out again after expiry is still told apart from its predecessor.

use crate::error::{SessionError, SessionResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rqr_types::{AuthToken, MessageId, MessageKind, MessagePayload, Role, SessionCode, StoredMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Attempts at finding an unused code before giving up.
const MAX_CODE_ATTEMPTS: usize = 1024;

/// Identity of one session instance, unique for the lifetime of the store.
pub type SessionEpoch = u64;

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One pairing session.
#[derive(Debug)]
struct Session {
    epoch: SessionEpoch,
    /// Role of the side that created the session.
    mode: Role,
    initiator_public_key: Option<String>,
    responder_public_key: Option<String>,
    receiver_token: AuthToken,
    sender_token: Option<AuthToken>,
    sender_connected: bool,
    messages: Vec<StoredMessage>,
    last_message_id: MessageId,
    created_at_ms: u64,
    expires_at_ms: u64,
    expires_at: Instant,
}

impl Session {
    fn new(epoch: SessionEpoch, initiator_public_key: Option<String>, ttl: Duration) -> Self {
        let now = SystemTime::now();
        let created_at_ms = unix_millis(now);
        Self {
            epoch,
            mode: Role::Receiver,
            initiator_public_key,
            responder_public_key: None,
            receiver_token: AuthToken::random(),
            sender_token: None,
            sender_connected: false,
            messages: Vec::new(),
            last_message_id: MessageId::default(),
            created_at_ms,
            // Keep the reported expiry strictly after creation even for tiny TTLs.
            expires_at_ms: created_at_ms + (ttl.as_millis() as u64).max(1),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn token_for(&self, role: Role) -> Option<&AuthToken> {
        match role {
            Role::Receiver => Some(&self.receiver_token),
            Role::Sender => self.sender_token.as_ref(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let newest = self.messages.last();
        SessionSnapshot {
            epoch: self.epoch,
            mode: self.mode,
            initiator_public_key: self.initiator_public_key.clone(),
            responder_public_key: self.responder_public_key.clone(),
            sender_connected: self.sender_connected,
            message_count: self.messages.len(),
            newest_message: newest.map(|m| (m.message_id, m.payload.kind())),
            created_at_ms: self.created_at_ms,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// Result of creating a session.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    /// Allocated code.
    pub code: SessionCode,
    /// Token the receiver subscribes with.
    pub receiver_token: AuthToken,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Expiry, milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinTicket {
    /// Session the sender joined.
    pub epoch: SessionEpoch,
    /// Token the sender subscribes with; replaces any earlier sender token.
    pub sender_token: AuthToken,
    /// Receiver key, if known.
    pub initiator_public_key: Option<String>,
    /// Sender key as now stored.
    pub responder_public_key: Option<String>,
}

/// Read-only view of a session's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session instance the snapshot was taken from.
    pub epoch: SessionEpoch,
    /// Role of the creator.
    pub mode: Role,
    /// Receiver key, if known.
    pub initiator_public_key: Option<String>,
    /// Sender key, if known.
    pub responder_public_key: Option<String>,
    /// Whether a sender currently holds the slot.
    pub sender_connected: bool,
    /// Mailbox size.
    pub message_count: usize,
    /// Id and kind of the newest message.
    pub newest_message: Option<(MessageId, MessageKind)>,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Expiry, milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
}

impl SessionSnapshot {
    /// Public key held by `role`, if any.
    pub fn public_key(&self, role: Role) -> Option<&str> {
        match role {
            Role::Receiver => self.initiator_public_key.as_deref(),
            Role::Sender => self.responder_public_key.as_deref(),
        }
    }
}

/// A message appended to a mailbox.
#[derive(Debug, Clone)]
pub struct Appended {
    /// The stored message.
    pub message: StoredMessage,
    /// Mailbox size after the append.
    pub count: usize,
    /// Session the mailbox belongs to.
    pub epoch: SessionEpoch,
}

/// Registry of pairing sessions.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<SessionCode, Session>,
    ttl: Duration,
    next_epoch: AtomicU64,
}

impl SessionStore {
    /// Create an empty store whose sessions live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            next_epoch: AtomicU64::new(1),
        }
    }

    fn new_session(&self, initiator_public_key: Option<String>) -> Session {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        Session::new(epoch, initiator_public_key, self.ttl)
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session under a fresh code.
    ///
    /// The uniqueness check and the insert happen under one entry lock. A code
    /// held by an expired session counts as free.
    pub fn create_session(
        &self,
        initiator_public_key: Option<String>,
    ) -> SessionResult<SessionTicket> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = SessionCode::random();
            if let Some(ticket) = self.insert_at(code, initiator_public_key.clone()) {
                return Ok(ticket);
            }
        }

        tracing::error!(
            "No free session code after {} attempts ({} sessions live)",
            MAX_CODE_ATTEMPTS,
            self.sessions.len()
        );
        Err(SessionError::CodeSpaceExhausted)
    }

    /// Create a session under `code` unless a live session holds it.
    pub(crate) fn insert_at(
        &self,
        code: SessionCode,
        initiator_public_key: Option<String>,
    ) -> Option<SessionTicket> {
        let now = Instant::now();
        let session = match self.sessions.entry(code.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().is_expired(now) => {
                occupied.insert(self.new_session(initiator_public_key));
                occupied.into_ref()
            }
            Entry::Occupied(_) => {
                tracing::debug!("Code collision on {}, retrying", code);
                return None;
            }
            Entry::Vacant(vacant) => vacant.insert(self.new_session(initiator_public_key)),
        };

        tracing::info!("Session created: code={}", code);
        Some(SessionTicket {
            code,
            receiver_token: session.receiver_token.clone(),
            created_at_ms: session.created_at_ms,
            expires_at_ms: session.expires_at_ms,
        })
    }

    /// Run `f` against a live session, evicting it if it has expired.
    fn with_live<T>(
        &self,
        code: &SessionCode,
        f: impl FnOnce(&mut Session) -> T,
    ) -> SessionResult<T> {
        let now = Instant::now();
        if let Some(mut session) = self.sessions.get_mut(code) {
            if !session.is_expired(now) {
                return Ok(f(session.value_mut()));
            }
        }

        if self
            .sessions
            .remove_if(code, |_, session| session.is_expired(now))
            .is_some()
        {
            tracing::debug!("Evicted expired session on read: code={}", code);
        }
        Err(SessionError::NotFound { code: code.clone() })
    }

    /// Claim the sender slot.
    ///
    /// Fails with `Conflict` while another sender holds the slot. On success a
    /// fresh sender token replaces any earlier one, so a token from a previous
    /// sender epoch stops working.
    pub fn join_session(
        &self,
        code: &SessionCode,
        responder_public_key: Option<String>,
    ) -> SessionResult<JoinTicket> {
        self.with_live(code, |session| {
            if session.sender_connected {
                return Err(SessionError::Conflict { code: code.clone() });
            }

            if responder_public_key.is_some() {
                session.responder_public_key = responder_public_key;
            }
            session.sender_connected = true;
            let sender_token = AuthToken::random();
            session.sender_token = Some(sender_token.clone());

            Ok(JoinTicket {
                epoch: session.epoch,
                sender_token,
                initiator_public_key: session.initiator_public_key.clone(),
                responder_public_key: session.responder_public_key.clone(),
            })
        })
        .and_then(|joined| joined)
        .inspect(|_| tracing::info!("Sender joined: code={}", code))
    }

    /// Store the receiver's public key after creation.
    pub fn set_receiver_key(
        &self,
        code: &SessionCode,
        token: &AuthToken,
        initiator_public_key: String,
    ) -> SessionResult<SessionEpoch> {
        self.with_live(code, |session| {
            if !session.receiver_token.ct_eq(token) {
                return Err(SessionError::Unauthorized { code: code.clone() });
            }
            session.initiator_public_key = Some(initiator_public_key);
            Ok(session.epoch)
        })
        .and_then(|set| set)
    }

    /// Check `token` against the token issued to `role` and, in the same
    /// critical section, snapshot the session it belongs to.
    pub fn authorize(
        &self,
        code: &SessionCode,
        role: Role,
        token: &AuthToken,
    ) -> SessionResult<SessionSnapshot> {
        self.with_live(code, |session| {
            let valid = session
                .token_for(role)
                .map(|expected| expected.ct_eq(token))
                .unwrap_or(false);
            valid.then(|| session.snapshot())
        })?
        .ok_or_else(|| SessionError::Unauthorized { code: code.clone() })
    }

    /// Check `token` against the token issued to `role`.
    ///
    /// Returns false for unknown or expired codes, roles without a token yet,
    /// and mismatches. The comparison does not short-circuit.
    pub fn validate_token(&self, code: &SessionCode, role: Role, token: &AuthToken) -> bool {
        self.authorize(code, role, token).is_ok()
    }

    /// Epoch of the live session under `code`, if any.
    pub fn current_epoch(&self, code: &SessionCode) -> Option<SessionEpoch> {
        self.with_live(code, |session| session.epoch).ok()
    }

    /// Re-open the sender slot after the sender holding `token` went away.
    ///
    /// Does nothing when `token` belongs to an earlier sender epoch, so a stale
    /// connection closing cannot evict the current sender. Returns whether the
    /// slot was released.
    pub fn release_sender(&self, code: &SessionCode, token: &AuthToken) -> bool {
        let released = self
            .with_live(code, |session| {
                let current = session
                    .sender_token
                    .as_ref()
                    .map(|expected| expected.ct_eq(token))
                    .unwrap_or(false);
                let release = current && session.sender_connected;
                if release {
                    session.sender_connected = false;
                }
                release
            })
            .unwrap_or(false);

        if released {
            tracing::info!("Sender slot released: code={}", code);
        }
        released
    }

    /// Append a message to the mailbox.
    pub fn store_message(
        &self,
        code: &SessionCode,
        payload: MessagePayload,
    ) -> SessionResult<Appended> {
        self.with_live(code, |session| {
            let now_ms = unix_millis(SystemTime::now());
            let message_id = session.last_message_id.next_after(now_ms);
            session.last_message_id = message_id;

            let message = StoredMessage {
                message_id,
                timestamp: now_ms,
                payload,
            };
            session.messages.push(message.clone());
            Appended {
                message,
                count: session.messages.len(),
                epoch: session.epoch,
            }
        })
    }

    /// Copy of the full mailbox in insertion order.
    pub fn get_messages(&self, code: &SessionCode) -> SessionResult<Vec<StoredMessage>> {
        self.with_live(code, |session| session.messages.clone())
    }

    /// Current state of a session.
    pub fn snapshot(&self, code: &SessionCode) -> SessionResult<SessionSnapshot> {
        self.with_live(code, |session| session.snapshot())
    }

    /// Remove every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }
}
