use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, instrument};

use crate::db::{with_retry, RetryPolicy, StatusStore, StoreError};

/// Deletes probe results that fell out of the rolling retention window.
pub struct RetentionTask {
    statuses: Arc<dyn StatusStore>,
    retention: chrono::Duration,
    retry: RetryPolicy,
}

impl RetentionTask {
    pub fn new(statuses: Arc<dyn StatusStore>, retention: chrono::Duration, retry: RetryPolicy) -> Self {
        Self {
            statuses,
            retention,
            retry,
        }
    }

    pub async fn run_periodic(self: Arc<Self>, interval_duration: Duration, shutdown: impl Future<Output = ()>) {
        info!(
            interval_seconds = interval_duration.as_secs(),
            retention_days = self.retention.num_days(),
            "Status retention task started."
        );
        let mut interval = time::interval(interval_duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.prune_once(Utc::now()).await {
                    error!(error = %e, "Status retention pass failed.");
                }
            });
        }
    }

    /// Removes results older than `now - retention`; returns how many went.
    #[instrument(skip(self), fields(retention_days = self.retention.num_days()))]
    pub async fn prune_once(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - self.retention;
        let removed = with_retry(&self.retry, "prune_statuses_before", || {
            self.statuses.prune_statuses_before(cutoff)
        })
        .await?;
        info!(%cutoff, removed, "Pruned expired probe results.");
        Ok(removed)
    }
}
