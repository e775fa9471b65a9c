use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    db::ReadingStore,
    sensor::{DeviceIdentity, StoredReading},
    session::{CollectionOutcome, DeviceSession, Transport},
};

pub const MAX_ATTEMPTS: u32 = 3;

pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Something that can attempt to produce one reading.
pub trait ReadingSource: Send + Sync + 'static {
    fn device(&self) -> DeviceIdentity;

    fn read_once(&self) -> impl Future<Output = CollectionOutcome> + Send;
}

impl<T: Transport + 'static> ReadingSource for DeviceSession<T> {
    fn device(&self) -> DeviceIdentity {
        DeviceSession::device(self)
    }

    async fn read_once(&self) -> CollectionOutcome {
        DeviceSession::read_once(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl CollectionPolicy {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            poll_interval,
        }
    }
}

#[derive(Debug)]
pub struct Collector<S, D> {
    source: S,
    store: D,
    policy: CollectionPolicy,
}

impl<S: ReadingSource, D: ReadingStore> Collector<S, D> {
    pub fn new(source: S, store: D, policy: CollectionPolicy) -> Self {
        Self {
            source,
            store,
            policy,
        }
    }

    /// Collects forever, one cycle per poll interval.
    pub async fn run(self) {
        loop {
            self.run_cycle().await;

            info!(
                poll_interval_secs = self.policy.poll_interval.as_secs(),
                "waiting until next scheduled collection"
            );
            sleep(self.policy.poll_interval).await;
        }
    }

    /// Up to `max_attempts` sessions, stopping at the first reading. Returns
    /// the stored row, or `None` if every attempt failed or the write did.
    pub async fn run_cycle(&self) -> Option<StoredReading> {
        let address = self.source.device();
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            info!(%address, attempt, max_attempts, "collection attempt");

            match self.source.read_once().await {
                Ok(reading) => {
                    return match self.store.insert(&reading).await {
                        Ok(stored) => {
                            info!(
                                id = stored.id,
                                temperature_celsius = %format!("{:.2}", reading.temperature_celsius),
                                humidity_percent = reading.humidity_percent,
                                captured_at = %reading.captured_at.format("%Y-%m-%d %H:%M:%S %Z"),
                                "saved reading"
                            );
                            Some(stored)
                        }
                        Err(e) => {
                            error!(%address, error = %e, "failed to store reading, discarding it");
                            None
                        }
                    };
                }
                Err(reason) => {
                    if attempt < max_attempts {
                        warn!(
                            %address,
                            attempt,
                            %reason,
                            retry_in_secs = self.policy.retry_delay.as_secs(),
                            "collection attempt failed, retrying"
                        );
                        sleep(self.policy.retry_delay).await;
                    } else {
                        warn!(%address, attempt, %reason, "collection attempt failed");
                    }
                }
            }
        }

        error!(
            %address,
            max_attempts,
            "failed to collect a reading, will try again next interval"
        );
        None
    }
}
