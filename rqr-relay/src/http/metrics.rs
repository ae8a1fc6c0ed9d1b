//! Prometheus metrics endpoint.

use crate::server::Relay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Append one metric in Prometheus text format.
fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP reverseqr_{name} {help}");
    let _ = writeln!(out, "# TYPE reverseqr_{name} {kind}");
    let _ = writeln!(out, "reverseqr_{name} {value}");
    out.push('\n');
}

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<Relay>>) -> impl IntoResponse {
    let m = relay.metrics();
    let counter = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed);

    let mut body = String::new();
    let _ = writeln!(body, "# HELP reverseqr_info Server information");
    let _ = writeln!(body, "# TYPE reverseqr_info gauge");
    let _ = writeln!(
        body,
        "reverseqr_info{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    );

    // Gauges
    write_metric(
        &mut body,
        "sessions_active",
        "gauge",
        "Sessions in the registry",
        relay.sessions().len() as u64,
    );
    write_metric(
        &mut body,
        "ws_connections_active",
        "gauge",
        "Open signaling connections",
        relay.hub().connection_count() as u64,
    );
    write_metric(
        &mut body,
        "rate_limit_keys",
        "gauge",
        "Caller keys tracked by the rate limiters",
        relay.rate_limits().tracked_keys() as u64,
    );

    // Counters
    let counters = [
        ("sessions_created_total", "Sessions created", &m.sessions_created),
        ("joins_total", "Successful sender joins", &m.joins_total),
        ("join_conflicts_total", "Joins refused while a sender was connected", &m.join_conflicts),
        ("messages_stored_total", "Messages appended to mailboxes", &m.messages_stored),
        ("files_uploaded_total", "Files written to blob storage", &m.files_uploaded),
        ("bytes_uploaded_total", "Ciphertext bytes written to blob storage", &m.bytes_uploaded),
        ("downloads_started_total", "File downloads started", &m.downloads_started),
        ("ws_connections_total", "Signaling connections accepted", &m.ws_connections_total),
        ("auth_failures_total", "Subscribe attempts with an invalid token", &m.auth_failures),
        ("rate_limit_hits_total", "Requests rejected by rate limiting", &m.rate_limit_hits),
        ("sessions_swept_total", "Expired sessions removed by the sweep", &m.sessions_swept),
        ("blobs_swept_total", "Blobs removed by the retention sweep", &m.blobs_swept),
        ("deletions_deferred_total", "Blob deletions postponed by an active download", &m.deletions_deferred),
    ];
    for (name, help, value) in counters {
        write_metric(&mut body, name, "counter", help, counter(value));
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
