//! Periodic sweep of expired task leases.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::queue::TaskQueue;

/// Spawn the reaper loop. Each sweep treats every expired lease as a failed
/// attempt, so a crashed leaser is indistinguishable from a timeout.
pub fn spawn_reaper(queue: Arc<TaskQueue>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match queue.reap_expired().await {
                Ok(0) => {}
                Ok(swept) => {
                    tracing::info!(swept, "Reaper re-queued expired task leases");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reaper sweep failed");
                }
            }
        }
    })
}
