//! Periodic expiry sweeping.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use super::endpoint::Endpoints;

/// Runs [`Endpoints::sweep_expired`] every `interval` until the returned
/// task is aborted.
///
/// Sweeping only deletes entries that are already unusable, so it never
/// competes with a redemption in flight.
pub fn spawn_sweeper(endpoints: Endpoints, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match endpoints.sweep_expired().await {
                Ok(report) if report.total() > 0 => debug!(removed = report.total(), "sweep finished"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "sweep failed"),
            }
        }
    })
}

/// [`spawn_sweeper`] with the configured `sweep_interval_secs`.
pub fn spawn_configured_sweeper(endpoints: Endpoints) -> JoinHandle<()> {
    let interval = endpoints.server().config().sweep_interval();
    spawn_sweeper(endpoints, interval)
}
