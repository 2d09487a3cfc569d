//! Background reconciliation between the memory working set and the durable index
//!
//! Two timers drive the loop: a frequent sync of dirty metadata and a slower cleanup
//! that expires idle entries and purges old index rows. A tick always runs to
//! completion; cancellation is only observed between ticks. One final sync runs after
//! the loop stops.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::cache_service::CacheService;
use crate::config::ReconciliationConfig;

pub struct ReconciliationLoop {
    service: Arc<CacheService>,
    sync_interval: Duration,
    cleanup_interval: Duration,
}

impl ReconciliationLoop {
    pub fn new(service: Arc<CacheService>, config: &ReconciliationConfig) -> Self {
        Self {
            service,
            sync_interval: config.sync_interval.max(Duration::from_millis(10)),
            cleanup_interval: config.cleanup_interval.max(Duration::from_millis(10)),
        }
    }

    /// Run until `cancellation_token` fires, then sync once more
    pub async fn run(self, cancellation_token: CancellationToken) {
        info!(
            "Starting reconciliation loop (sync every {}, cleanup every {})",
            humantime::format_duration(self.sync_interval),
            humantime::format_duration(self.cleanup_interval)
        );

        // First ticks land one period from now, not immediately
        let start = Instant::now();
        let mut sync_tick = interval_at(start + self.sync_interval, self.sync_interval);
        let mut cleanup_tick = interval_at(start + self.cleanup_interval, self.cleanup_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Reconciliation loop received cancellation signal, shutting down");
                    break;
                }
                _ = sync_tick.tick() => {
                    match self.service.sync().await {
                        Ok(report) if report.flushed > 0 => {
                            debug!("Sync flushed {} entries ({} still dirty)", report.flushed, report.still_dirty);
                        }
                        Ok(_) => {}
                        Err(e) => error!("Sync failed, will retry next tick: {}", e),
                    }
                }
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.service.cleanup().await {
                        error!("Cleanup failed: {}", e);
                    }
                }
            }
        }

        match self.service.sync().await {
            Ok(report) => info!("Reconciliation stopped after final sync of {} entries", report.flushed),
            Err(e) => error!("Final sync failed: {}", e),
        }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancellation_token))
    }
}
