use crate::{metrics::QueueMetrics, queue::WorkQueue, Key, Reconciler};
use metadata_controller_core::MappingCache;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, warn};

/// Processes keys until the queue is shut down and drained.
///
/// An item is always marked done or retried before the next one is taken, so shutting down the
/// queue never interrupts a reconciliation.
pub async fn process<C: MappingCache>(
    reconciler: Arc<Reconciler<C>>,
    queue: WorkQueue<Key>,
    metrics: QueueMetrics,
) {
    while let Some(item) = queue.dequeue().await {
        metrics.depth.set(queue.len() as i64);
        match reconciler.reconcile(item.key()) {
            Ok(()) => queue.done(item),
            Err(error) => {
                warn!(key = ?item.key(), %error, "Reconciliation failed");
                if queue.retry(item) {
                    metrics.retries.inc();
                } else {
                    metrics.dropped.inc();
                }
            }
        }
    }
    debug!("Work queue closed");
}

/// Periodically republishes every node bundle so that live bundles are refreshed before they
/// expire. Stops once the queue is shut down.
pub async fn resync<C: MappingCache>(
    reconciler: Arc<Reconciler<C>>,
    queue: WorkQueue<Key>,
    period: time::Duration,
) {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if queue.is_shutdown() {
            return;
        }

        match reconciler.refresh() {
            Ok(nodes) => debug!(nodes, "Resynced"),
            Err(error) => warn!(%error, "Resync failed"),
        }
    }
}
