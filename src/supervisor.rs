use std::future::Future;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::{
    collector::{Collector, ReadingSource},
    db::ReadingStore,
    retention::Retention,
};

/// Runs collection and retention side by side until `shutdown` resolves.
///
/// Neither loop ever finishes on its own, so a task that ends (i.e. panicked)
/// is reported as an error.
pub async fn run<S, D>(
    collector: Collector<S, D>,
    retention: Retention<D>,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    S: ReadingSource,
    D: ReadingStore,
{
    let mut retention_task = tokio::spawn(retention.run());
    let mut collection_task = tokio::spawn(collector.run());

    let result = tokio::select! {
        _ = shutdown => {
            info!("shutdown requested");
            Ok(())
        }
        res = &mut collection_task => Err(anyhow!("collection task stopped unexpectedly: {res:?}")),
        res = &mut retention_task => Err(anyhow!("retention task stopped unexpectedly: {res:?}")),
    };

    collection_task.abort();
    retention_task.abort();

    result
}
