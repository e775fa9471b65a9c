use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::db::ReadingStore;

pub const RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodically deletes readings older than the retention window.
#[derive(Debug)]
pub struct Retention<D> {
    store: D,
    window: TimeDelta,
    period: Duration,
}

impl<D: ReadingStore> Retention<D> {
    pub fn new(store: D, window: TimeDelta) -> Self {
        Self {
            store,
            window,
            period: RETENTION_PERIOD,
        }
    }

    pub async fn run(self) {
        loop {
            info!("running data retention policy");
            self.apply().await;
            sleep(self.period).await;
        }
    }

    /// One pass. Errors are logged; the next pass runs on schedule anyway.
    pub async fn apply(&self) -> Option<u64> {
        let Some(threshold) = Utc::now().checked_sub_signed(self.window) else {
            error!(
                window_days = self.window.num_days(),
                "retention window reaches past the earliest representable time, skipping"
            );
            return None;
        };

        match self.store.delete_older_than(threshold).await {
            Ok(0) => {
                debug!(window_days = self.window.num_days(), "no readings to delete");
                Some(0)
            }
            Ok(deleted) => {
                info!(
                    deleted,
                    window_days = self.window.num_days(),
                    "deleted expired readings"
                );
                Some(deleted)
            }
            Err(e) => {
                error!(error = %e, "failed to apply retention policy");
                None
            }
        }
    }
}
