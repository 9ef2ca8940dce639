//! Auto-sync scheduler
//!
//! Explicit timer registry for scheduled position syncs: one tokio task
//! per connection, start/stop idempotent, and a shutdown hook that
//! cancels every outstanding timer so no background work outlives the
//! process. No module-level state; the scheduler is constructed and
//! owned by the application.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::position_sync::PositionSyncEngine;
use super::ServiceError;
use crate::config::clamp_sync_interval;

pub struct SyncScheduler {
    engine: Arc<PositionSyncEngine>,
    default_interval: Duration,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<PositionSyncEngine>, default_interval: Duration) -> Self {
        Self {
            engine,
            default_interval: clamp_sync_interval(default_interval),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Start auto-sync for a connection. Idempotent: returns false and
    /// leaves the running timer alone if one exists. The interval is
    /// clamped to the legal bounds.
    pub async fn start(&self, connection_id: &str, interval: Option<Duration>) -> bool {
        let mut timers = self.timers.lock().await;

        if let Some(handle) = timers.get(connection_id) {
            if !handle.is_finished() {
                info!("Auto-sync already running for connection {}", connection_id);
                return false;
            }
            // A finished handle means the timer stopped itself (e.g.
            // the connection went inactive); replace it.
            timers.remove(connection_id);
        }

        let interval = clamp_sync_interval(interval.unwrap_or(self.default_interval));
        let engine = self.engine.clone();
        let id = connection_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the timer
            // starts counting from now.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.sync_connection(&id).await {
                    Ok(outcome) => {
                        tracing::debug!("Scheduled sync for {}: {:?}", id, outcome);
                    }
                    Err(ServiceError::ConnectionInactive(_))
                    | Err(ServiceError::NotFound(_)) => {
                        warn!(
                            "Connection {} is gone or inactive; stopping auto-sync",
                            id
                        );
                        break;
                    }
                    Err(e) => {
                        // Transient or broker-side failure: the error is
                        // already recorded on the connection; keep the
                        // timer alive for the next tick.
                        error!("Scheduled sync failed for {}: {}", id, e);
                    }
                }
            }
        });

        timers.insert(connection_id.to_string(), handle);
        info!(
            "Started auto-sync for connection {} every {:?}",
            connection_id, interval
        );
        true
    }

    /// Stop auto-sync for a connection. Idempotent: returns false if no
    /// timer was running.
    pub async fn stop(&self, connection_id: &str) -> bool {
        let mut timers = self.timers.lock().await;
        match timers.remove(connection_id) {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                if was_running {
                    info!("Stopped auto-sync for connection {}", connection_id);
                }
                was_running
            }
            None => false,
        }
    }

    pub async fn is_running(&self, connection_id: &str) -> bool {
        let timers = self.timers.lock().await;
        timers
            .get(connection_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Cancel every outstanding timer. Called on process shutdown.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        let count = timers.len();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        if count > 0 {
            info!("Cancelled {} auto-sync timer(s) on shutdown", count);
        }
    }
}
