//! `GET /health`: liveness plus a few registry sizes.

use crate::server::Relay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Body of a health response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Always `"ok"` while the process is serving.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Sessions held in the registry, expired ones included until swept.
    pub sessions: usize,
    /// Live signaling connections.
    pub connections: usize,
    /// Seconds since startup.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    fn of(relay: &Relay) -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            sessions: relay.sessions().len(),
            connections: relay.hub().connection_count(),
            uptime_seconds: relay.uptime().as_secs(),
        }
    }
}

/// Report relay health.
pub async fn health_handler(Extension(relay): Extension<Arc<Relay>>) -> Json<HealthStatus> {
    Json(HealthStatus::of(&relay))
}
