use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn, debug};

use crate::{QueueResult, JobQueue};

/// Lease expiry reaper for reclaiming jobs whose worker went silent
pub struct LeaseReaper {
    queue: JobQueue,
    interval: Duration,
}

impl LeaseReaper {
    /// Create a new lease reaper
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            interval: Duration::from_secs(30), // Run every 30 seconds
        }
    }

    /// Create reaper with custom interval
    pub fn with_interval(queue: JobQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Spawn the reaper loop; it stops once `shutdown` flips to `true` or its sender is dropped
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting lease reaper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.reap_expired_leases().await {
                        Ok(0) => debug!("No expired leases found"),
                        Ok(_) => {}
                        Err(e) => warn!("Error during lease reaping: {}", e),
                    }
                }
            }
        }

        info!("Lease reaper stopped");
    }

    /// Run one reaper cycle
    pub async fn reap_expired_leases(&self) -> QueueResult<usize> {
        self.queue.reclaim_expired().await
    }
}
