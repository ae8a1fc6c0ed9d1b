//! Rate limiting for reverseqr-relay.
//!
//! Four independent tiers guard the HTTP surface:
//! - **global**: one counter shared by every request (coarse overload protection)
//! - **api**: per caller, every `/api` route
//! - **session**: per caller, session creation
//! - **upload**: per caller, message sends
//!
//! Callers are identified by peer IP address. Each tier is a governor limiter
//! whose quota admits `max_requests` per `window_ms`: the full budget is
//! available as a burst and refills evenly across the window.
//!
//! This is a token bucket, not a fixed-window counter. A caller that spends
//! the full burst and then keeps sending at the refill rate gets up to
//! `2 * max_requests - 1` requests through within one `window_ms` span. An
//! instantaneous burst never exceeds `max_requests`.

use crate::config::{ConfigError, LimitsConfig, WindowLimit};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Which tier a check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Shared by all requests.
    Global,
    /// General API traffic.
    Api,
    /// Session creation.
    Session,
    /// Message sends and uploads.
    Upload,
}

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    global_limiter: Arc<DirectLimiter>,
    api_limiter: Arc<KeyedLimiter<IpAddr>>,
    session_limiter: Arc<KeyedLimiter<IpAddr>>,
    upload_limiter: Arc<KeyedLimiter<IpAddr>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("global_limiter", &"DirectLimiter")
            .field("api_limiter", &"KeyedLimiter<IpAddr>")
            .field("session_limiter", &"KeyedLimiter<IpAddr>")
            .field("upload_limiter", &"KeyedLimiter<IpAddr>")
            .finish()
    }
}

/// Build a quota admitting `max_requests` per window.
fn window_quota(field: &'static str, limit: WindowLimit) -> Result<Quota, ConfigError> {
    let invalid = || ConfigError::Invalid {
        field,
        reason: "window_ms and max_requests must be > 0".to_string(),
    };
    let burst = NonZeroU32::new(limit.max_requests).ok_or_else(invalid)?;
    let period = limit.window() / limit.max_requests;
    Quota::with_period(period)
        .map(|quota| quota.allow_burst(burst))
        .ok_or_else(invalid)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a tier has a zero window or budget.
    pub fn new(config: &LimitsConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            global_limiter: Arc::new(RateLimiter::direct(window_quota(
                "limits.global",
                config.global,
            )?)),
            api_limiter: Arc::new(RateLimiter::keyed(window_quota("limits.api", config.api)?)),
            session_limiter: Arc::new(RateLimiter::keyed(window_quota(
                "limits.session",
                config.session,
            )?)),
            upload_limiter: Arc::new(RateLimiter::keyed(window_quota(
                "limits.upload",
                config.upload,
            )?)),
        })
    }

    /// Check one tier for a caller.
    ///
    /// The caller is ignored for the global tier.
    pub fn check(&self, tier: Tier, caller: &IpAddr) -> Result<(), RateLimitError> {
        match tier {
            Tier::Global => self
                .global_limiter
                .check()
                .map_err(|_| RateLimitError::GlobalLimitExceeded),
            Tier::Api => self
                .api_limiter
                .check_key(caller)
                .map_err(|_| RateLimitError::ApiLimitExceeded),
            Tier::Session => self
                .session_limiter
                .check_key(caller)
                .map_err(|_| RateLimitError::SessionLimitExceeded),
            Tier::Upload => self
                .upload_limiter
                .check_key(caller)
                .map_err(|_| RateLimitError::UploadLimitExceeded),
        }
    }

    /// Check every tier in order, stopping at the first rejection.
    pub fn check_all(&self, tiers: &[Tier], caller: &IpAddr) -> Result<(), RateLimitError> {
        tiers.iter().try_for_each(|tier| self.check(*tier, caller))
    }

    /// Get the number of tracked caller keys across keyed tiers (for metrics).
    pub fn tracked_keys(&self) -> usize {
        self.api_limiter.len() + self.session_limiter.len() + self.upload_limiter.len()
    }

    /// Evict stale entries from the keyed rate limiter DashMaps.
    ///
    /// `retain_recent()` removes entries whose cells have fully recharged
    /// (idle callers). Called from the session sweep.
    pub fn shrink(&self) {
        self.api_limiter.retain_recent();
        self.session_limiter.retain_recent();
        self.upload_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Aggregate request rate exceeded across all callers.
    GlobalLimitExceeded,
    /// Too many API requests from this caller.
    ApiLimitExceeded,
    /// Too many session creations from this caller.
    SessionLimitExceeded,
    /// Too many uploads from this caller.
    UploadLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
            Self::ApiLimitExceeded => write!(f, "api rate limit exceeded"),
            Self::SessionLimitExceeded => write!(f, "session creation rate limit exceeded"),
            Self::UploadLimitExceeded => write!(f, "upload rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}
