//! Relay coordination.
//!
//! [`Relay`] ties the session registry, the signaling hub and blob storage
//! together: each transfer operation updates the registry first and then
//! pushes the matching hint to subscribed peers.

use crate::cleanup;
use crate::config::Config;
use crate::error::{Result, SessionError, SessionResult};
use crate::http;
use crate::limits::RateLimits;
use crate::session::{JoinTicket, SessionSnapshot, SessionStore, SessionTicket};
use crate::signaling::{Hint, SignalingHub};
use crate::storage::BlobStore;
use rqr_types::{AuthToken, MessagePayload, SessionCode, StoredMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Sessions created.
    pub sessions_created: AtomicU64,
    /// Successful sender joins.
    pub joins_total: AtomicU64,
    /// Joins refused because a sender was connected.
    pub join_conflicts: AtomicU64,
    /// Messages appended to mailboxes.
    pub messages_stored: AtomicU64,
    /// Files written to blob storage.
    pub files_uploaded: AtomicU64,
    /// Ciphertext bytes written to blob storage.
    pub bytes_uploaded: AtomicU64,
    /// Downloads started.
    pub downloads_started: AtomicU64,
    /// WebSocket connections accepted.
    pub ws_connections_total: AtomicU64,
    /// Subscribe attempts with a bad token.
    pub auth_failures: AtomicU64,
    /// Requests rejected by a rate limit tier.
    pub rate_limit_hits: AtomicU64,
    /// Expired sessions removed by the sweep.
    pub sessions_swept: AtomicU64,
    /// Blobs removed by the retention sweep.
    pub blobs_swept: AtomicU64,
    /// Blob deletions postponed by an active download.
    pub deletions_deferred: AtomicU64,
}

/// Shared relay state.
pub struct Relay {
    config: Config,
    sessions: Arc<SessionStore>,
    hub: SignalingHub,
    blobs: Arc<BlobStore>,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    started_at: Instant,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("sessions", &self.sessions.len())
            .field("connections", &self.hub.connection_count())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Build relay state from a validated configuration.
    ///
    /// Creates the blob directory if it does not exist.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let rate_limits = RateLimits::new(&config.limits)?;
        let blobs = Arc::new(BlobStore::open(&config.storage)?);
        let sessions = Arc::new(SessionStore::new(config.sessions.ttl()));
        let hub = SignalingHub::new(Arc::clone(&sessions));

        Ok(Self {
            config,
            sessions,
            hub,
            blobs,
            rate_limits,
            metrics: RelayMetrics::default(),
            started_at: Instant::now(),
        })
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the session registry.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Get the signaling hub.
    pub fn hub(&self) -> &SignalingHub {
        &self.hub
    }

    /// Get the blob store.
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Time since startup.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Create a session for a receiver.
    pub fn create_session(&self, initiator_public_key: Option<String>) -> SessionResult<SessionTicket> {
        let ticket = self.sessions.create_session(initiator_public_key)?;
        self.metrics.sessions_created.fetch_add(1, Ordering::Relaxed);
        Ok(ticket)
    }

    /// Join a session as sender and announce the sender key to receivers.
    pub fn join_session(
        &self,
        code: &SessionCode,
        responder_public_key: Option<String>,
    ) -> SessionResult<JoinTicket> {
        let joined = self.hub.publish(code, |store| {
            let hint = responder_public_key.as_deref().map(Hint::sender_key);
            let ticket = store.join_session(code, responder_public_key)?;
            let epoch = ticket.epoch;
            Ok((ticket, epoch, hint))
        });
        match joined {
            Ok(published) => {
                self.metrics.joins_total.fetch_add(1, Ordering::Relaxed);
                Ok(published.value)
            }
            Err(err @ SessionError::Conflict { .. }) => {
                self.metrics.join_conflicts.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Join refused, sender already connected: code={}", code);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Store the receiver key and announce it to senders.
    pub fn set_receiver_key(
        &self,
        code: &SessionCode,
        token: &AuthToken,
        initiator_public_key: String,
    ) -> SessionResult<()> {
        self.hub.publish(code, |store| {
            let hint = Hint::receiver_key(&initiator_public_key);
            let epoch = store.set_receiver_key(code, token, initiator_public_key)?;
            Ok(((), epoch, Some(hint)))
        })?;
        Ok(())
    }

    /// Append a message and tell receivers it is there.
    pub fn post_message(
        &self,
        code: &SessionCode,
        payload: MessagePayload,
    ) -> SessionResult<StoredMessage> {
        let kind = payload.kind();
        let published = self.hub.publish(code, |store| {
            let appended = store.store_message(code, payload)?;
            let hint = Hint::message(appended.count, appended.message.message_id, kind);
            let epoch = appended.epoch;
            Ok((appended, epoch, Some(hint)))
        })?;
        self.metrics.messages_stored.fetch_add(1, Ordering::Relaxed);

        let appended = published.value;
        tracing::info!(
            "Message {} ({}) stored for {} ({} in mailbox, {} notified)",
            appended.message.message_id,
            kind,
            code,
            appended.count,
            published.delivered
        );
        Ok(appended.message)
    }

    /// Mailbox contents.
    pub fn messages(&self, code: &SessionCode) -> SessionResult<Vec<StoredMessage>> {
        self.sessions.get_messages(code)
    }

    /// Session state for status queries.
    pub fn status(&self, code: &SessionCode) -> SessionResult<SessionSnapshot> {
        self.sessions.snapshot(code)
    }
}

/// Serve HTTP and WebSocket traffic on `listener` until `shutdown` resolves.
///
/// Background sweeps run for the lifetime of the server. On shutdown they are
/// stopped, every signaling connection is told to close, and in-flight HTTP
/// requests are allowed to finish.
pub async fn serve<F>(relay: Arc<Relay>, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    let tasks = cleanup::spawn_background_tasks(&relay);
    let app = http::build_router(Arc::clone(&relay));

    tracing::info!("reverseqr-relay listening on {}", local_addr);
    tracing::info!("Public base URL: {}", relay.config().server.base_url);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        tracing::info!("Shutdown requested");
        tasks.shutdown();
        relay.hub().shutdown();
    })
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}
