//! Recovery of tasks stuck in `processing`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::task_store::{StoreError, TaskStore};

use super::engine::TaskEngine;

/// Error stored on tasks failed by the reaper.
pub const PROCESSING_TIMEOUT_MESSAGE: &str = "task processing timeout";

impl<S> TaskEngine<S>
where
    S: TaskStore + ?Sized + 'static,
{
    /// Fail every task that has been `processing` for longer than the TTL.
    pub async fn reap_once(&self) -> Result<u64, StoreError> {
        self.reap_at(Utc::now()).await
    }

    /// [`reap_once`](Self::reap_once) against an explicit clock reading.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let ttl = chrono::Duration::from_std(self.config.processing_ttl)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reaped = self
            .store
            .fail_stale_processing(cutoff, PROCESSING_TIMEOUT_MESSAGE)
            .await?;
        if reaped > 0 {
            warn!(count = reaped, cutoff = %cutoff, "failed stuck processing tasks");
            self.record(|s| s.reaped += reaped);
        } else {
            debug!("no stuck tasks");
        }
        Ok(reaped)
    }
}

pub(super) async fn reaper_loop<S>(engine: Arc<TaskEngine<S>>, mut shutdown: watch::Receiver<bool>)
where
    S: TaskStore + ?Sized + 'static,
{
    let period = engine.config.reaper_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = period.as_secs(),
        ttl_secs = engine.config.processing_ttl.as_secs(),
        "task reaper started"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = engine.reap_once().await {
                    error!(error = %err, "reaper sweep failed");
                    engine.record(|s| s.store_errors += 1);
                }
            }
        }
    }

    info!("task reaper stopped");
}
