//! Background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::engine::CacheEngine;

/// Periodically drop expired entries so they stop occupying capacity.
///
/// The returned handle runs until aborted.
pub fn spawn_sweeper(engine: Arc<CacheEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let removed = engine.sweep_expired();
            debug!(removed, remaining = engine.len(), "cache sweep finished");
        }
    })
}
