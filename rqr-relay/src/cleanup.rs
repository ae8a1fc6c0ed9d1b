//! Background sweeps.
//!
//! Two periodic tasks run alongside the server: one drops expired sessions
//! (with their subscribers and idle rate-limit keys), the other enforces blob
//! retention. The first
//! tick of each fires immediately, so blobs left over from a previous run are
//! swept at startup.

use crate::config::CleanupConfig;
use crate::server::Relay;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Handles of the running sweeps. Dropping it stops them.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stop every task.
    pub fn shutdown(self) {
        tracing::debug!("Stopping {} background tasks", self.handles.len());
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Start the session sweep and, if enabled, the retention sweep.
pub fn spawn_background_tasks(relay: &Arc<Relay>) -> BackgroundTasks {
    let sweep_interval = Duration::from_secs(relay.config().sessions.sweep_interval_secs);
    BackgroundTasks {
        handles: vec![
            spawn_session_sweep(Arc::clone(relay), sweep_interval),
            spawn_retention_sweep(Arc::clone(relay), relay.config().cleanup.clone()),
        ],
    }
}

/// Spawn the expired-session sweep.
pub fn spawn_session_sweep(relay: Arc<Relay>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Session sweep started (interval: {}s)", period.as_secs());
        let mut timer = interval(period);

        loop {
            timer.tick().await;

            let removed = relay.sessions().sweep_expired();
            let evicted = relay.hub().prune_expired();
            relay.rate_limits().shrink();
            if evicted > 0 {
                tracing::info!("Session sweep: closed {} stale subscriptions", evicted);
            }
            if removed > 0 {
                relay
                    .metrics()
                    .sessions_swept
                    .fetch_add(removed as u64, Ordering::Relaxed);
                tracing::info!("Session sweep: removed {} expired sessions", removed);
            } else {
                tracing::debug!("Session sweep: nothing expired");
            }
        }
    })
}

/// Spawn the blob retention sweep.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_retention_sweep(relay: Arc<Relay>, config: CleanupConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Retention sweep disabled");
            return;
        }

        tracing::info!(
            "Retention sweep started (interval: {}s, retention: {}s)",
            config.interval_secs,
            relay.blobs().retention().as_secs()
        );
        let mut timer = interval(Duration::from_secs(config.interval_secs));

        loop {
            timer.tick().await;

            let report = relay.blobs().sweep_expired().await;
            let metrics = relay.metrics();
            metrics.blobs_swept.fetch_add(report.deleted, Ordering::Relaxed);
            metrics
                .deletions_deferred
                .fetch_add(report.deferred, Ordering::Relaxed);

            if report.deleted > 0 || report.deferred > 0 || report.errors > 0 {
                tracing::info!(
                    "Retention sweep: deleted {}, deferred {}, errors {} ({} scanned)",
                    report.deleted,
                    report.deferred,
                    report.errors,
                    report.scanned
                );
            } else {
                tracing::debug!("Retention sweep: no expired blobs");
            }
        }
    })
}
