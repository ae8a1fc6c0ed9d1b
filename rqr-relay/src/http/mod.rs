//! HTTP endpoints for reverseqr-relay.
//!
//! Session pairing, message mailbox, file download, client config, the
//! WebSocket upgrade, plus health and metrics. Every request passes the rate
//! limit tiers that apply to its path before reaching a handler.

mod file;
pub mod health;
mod message;
mod metrics;
mod session;
mod ws;

use crate::error::ApiError;
use crate::limits::Tier;
use crate::server::Relay;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use rqr_types::{ClientConfig, SessionCode};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<Relay>) -> Router {
    let body_limit = usize::try_from(relay.config().storage.max_body_size).unwrap_or(usize::MAX);

    Router::new()
        .route("/api/session/create", post(session::create_handler))
        .route("/api/session/join", post(session::join_handler))
        .route("/api/session/key", post(session::receiver_key_handler))
        .route("/api/session/status/:code", get(session::status_handler))
        .route("/api/message/send", post(message::send_handler))
        .route("/api/message/retrieve/:code", get(message::retrieve_handler))
        .route("/api/file/download/:filename", get(file::download_handler))
        .route("/api/config", get(config_handler))
        .route("/join", get(join_redirect_handler))
        .route("/", get(ws::ws_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(rate_limit))
        .layer(Extension(relay))
}

/// Rate limit tiers for a request path.
fn tiers_for(path: &str) -> &'static [Tier] {
    match path {
        "/api/session/create" => &[Tier::Global, Tier::Api, Tier::Session],
        "/api/message/send" => &[Tier::Global, Tier::Api, Tier::Upload],
        p if p.starts_with("/api/") => &[Tier::Global, Tier::Api],
        _ => &[Tier::Global],
    }
}

/// Peer address of the request, or the unspecified address when the server
/// was not started with connect info (e.g. router tests).
fn caller_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

async fn rate_limit(Extension(relay): Extension<Arc<Relay>>, req: Request, next: Next) -> Response {
    let caller = caller_ip(&req);
    if let Err(e) = relay
        .rate_limits()
        .check_all(tiers_for(req.uri().path()), &caller)
    {
        relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Rate limited {} on {}: {}", caller, req.uri().path(), e);
        return ApiError::from(e).into_response();
    }
    next.run(req).await
}

/// Format a byte count for display: `0 Bytes`, `1.5 KB`, `5 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

/// Upload limits the client should enforce before sending.
async fn config_handler(Extension(relay): Extension<Arc<Relay>>) -> Json<ClientConfig> {
    let max_file_size = relay.blobs().max_file_size();
    Json(ClientConfig {
        max_file_size,
        max_file_size_formatted: format_bytes(max_file_size),
    })
}

#[derive(Debug, Deserialize)]
struct JoinQuery {
    code: Option<String>,
}

/// Target of the URL a QR code encodes.
async fn join_redirect_handler(Query(query): Query<JoinQuery>) -> Redirect {
    match query.code.as_deref().map(SessionCode::parse) {
        Some(Ok(code)) => Redirect::to(&format!("/sender?code={code}")),
        _ => Redirect::to("/sender"),
    }
}
