//! Periodic purge of usage events older than the retention window.

use crate::services::clock::Clock;
use crate::services::store::BillingStore;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct RetentionSweeper {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        retention_days: i64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention: chrono::Duration::days(retention_days),
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Delete events whose `occurred_at` is older than the retention window.
    pub async fn sweep_once(&self) -> Result<u64, AppError> {
        let cutoff = self.clock.now() - self.retention;
        let purged = self.store.purge_events_before(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged = purged, cutoff = %cutoff, "Expired usage events purged");
        }
        Ok(purged)
    }

    pub fn start(self: Arc<Self>) {
        if self.interval.is_zero() {
            tracing::info!("Retention sweeper disabled by configuration");
            return;
        }

        let shutdown = self.shutdown_token.clone();
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            retention_days = self.retention.num_days(),
            "Starting retention sweeper"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Retention sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::warn!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}
