use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    pub(crate) reconciles: Counter,
    pub(crate) errors: Counter,
    pub(crate) bundles_published: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct QueueMetrics {
    pub(crate) depth: Gauge,
    pub(crate) retries: Counter,
    pub(crate) dropped: Counter,
}

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Counter::default();
        prom.register(
            "reconciles",
            "Count of reconciliations attempted",
            reconciles.clone(),
        );

        let errors = Counter::default();
        prom.register(
            "reconcile_errors",
            "Count of reconciliations that failed",
            errors.clone(),
        );

        let bundles_published = Counter::default();
        prom.register(
            "bundles_published",
            "Count of node bundles written to the mapping cache",
            bundles_published.clone(),
        );

        Self {
            reconciles,
            errors,
            bundles_published,
        }
    }
}

impl QueueMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let depth = Gauge::default();
        prom.register(
            "queue_depth",
            "Number of keys waiting to be reconciled",
            depth.clone(),
        );

        let retries = Counter::default();
        prom.register(
            "retries",
            "Count of keys requeued after a failed reconciliation",
            retries.clone(),
        );

        let dropped = Counter::default();
        prom.register(
            "dropped",
            "Count of keys dropped after exhausting their retries",
            dropped.clone(),
        );

        Self {
            depth,
            retries,
            dropped,
        }
    }
}
