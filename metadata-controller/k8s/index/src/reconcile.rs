use crate::{metrics::ReconcileMetrics, views::SharedViews, Key};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use metadata_controller_core::{cache, MappingCache, MetadataMapperBundle, ServicesMapper};
use metadata_controller_k8s_api::ResourceId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::broadcast, time::Duration};
use tracing::{debug, instrument, trace};

/// Rebuilds node bundles from the current view state and publishes them to the mapping cache.
///
/// Every rebuild recomputes a node's mapping from all known `Endpoints`, so the result depends
/// only on the views and never on the order in which events were observed.
pub struct Reconciler<C> {
    views: SharedViews,
    cache: C,
    config: CacheConfig,

    /// The nodes each `Endpoints` resource last contributed to. Consulted when a resource is
    /// deleted and its addresses are no longer known. Also serializes rebuilds so that an older
    /// rebuild never replaces a newer bundle.
    contributions: Mutex<HashMap<ResourceId, HashSet<String>>>,

    processed: broadcast::Sender<ResourceId>,
    metrics: ReconcileMetrics,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub prefix: Arc<str>,
    pub ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("views have not completed their initial sync")]
    NotSynced,

    #[error("failed to publish bundle for node {node}: {source}")]
    Publish {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to evict bundle for node {node}: {source}")]
    Evict {
        node: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Freshly built mappings for a set of nodes.
#[derive(Debug, Default)]
struct Rebuild {
    mappers: HashMap<String, ServicesMapper>,
    /// The rebuilt nodes each `Endpoints` resource contributes to.
    contributors: HashMap<ResourceId, HashSet<String>>,
}

// === impl Reconciler ===

impl<C: MappingCache> Reconciler<C> {
    pub fn new(
        views: SharedViews,
        cache: C,
        config: CacheConfig,
        metrics: ReconcileMetrics,
    ) -> Self {
        let (processed, _) = broadcast::channel(128);
        Self {
            views,
            cache,
            config,
            contributions: Mutex::default(),
            processed,
            metrics,
        }
    }

    /// Receives the key of each `Endpoints` resource as its reconciliation completes.
    pub fn subscribe_processed(&self) -> broadcast::Receiver<ResourceId> {
        self.processed.subscribe()
    }

    pub fn reconcile(&self, key: &Key) -> Result<(), SyncError> {
        self.metrics.reconciles.inc();
        let res = match key {
            Key::Endpoints(id) => self.sync_endpoints(id),
            Key::Node(name) => self.sync_node(name),
        };
        if res.is_err() {
            self.metrics.errors.inc();
        }
        res
    }

    /// Recomputes and publishes the bundle of every node the `Endpoints` resource currently
    /// references or previously contributed to.
    #[instrument(skip_all, fields(%id))]
    pub fn sync_endpoints(&self, id: &ResourceId) -> Result<(), SyncError> {
        let mut contributions = self.contributions.lock();

        let rebuild = {
            let views = self.views.read();
            if !views.is_synced() {
                return Err(SyncError::NotSynced);
            }

            let mut nodes = contributions.get(id).cloned().unwrap_or_default();
            if let Some(addrs) = views.endpoints(id) {
                nodes.extend(
                    addrs
                        .addresses()
                        .filter_map(|a| views.resolve(a))
                        .map(|r| r.node.to_string()),
                );
            } else {
                debug!("Endpoints deleted");
            }

            if nodes.is_empty() {
                trace!("No nodes affected");
                drop(contributions);
                let _ = self.processed.send(id.clone());
                return Ok(());
            }

            build_mappers(&views, nodes, false)
        };

        self.publish(&mut contributions, rebuild)?;
        drop(contributions);

        let _ = self.processed.send(id.clone());
        Ok(())
    }

    /// Rebuilds and republishes, in one pass over the views, every node that a known `Endpoints`
    /// resource references or previously contributed to. Returns the number of nodes published.
    ///
    /// This keeps live bundles from expiring and picks up resources whose retries were exhausted.
    #[instrument(skip_all)]
    pub fn refresh(&self) -> Result<usize, SyncError> {
        let mut contributions = self.contributions.lock();

        let rebuild = {
            let views = self.views.read();
            if !views.is_synced() {
                return Err(SyncError::NotSynced);
            }
            let nodes = contributions
                .values()
                .flat_map(|nodes| nodes.iter().cloned())
                .collect();
            build_mappers(&views, nodes, true)
        };

        let nodes = rebuild.mappers.len();
        self.publish(&mut contributions, rebuild)?;
        debug!(nodes, "Refreshed node bundles");
        Ok(nodes)
    }

    /// Evicts a deleted node's bundle. Nodes that are still known are left untouched.
    #[instrument(skip(self))]
    pub fn sync_node(&self, name: &str) -> Result<(), SyncError> {
        let mut contributions = self.contributions.lock();
        if self.views.read().contains_node(name) {
            trace!("Node exists");
            return Ok(());
        }

        let key = cache::node_key(&self.config.prefix, name);
        self.cache
            .delete(&key)
            .map_err(|source| SyncError::Evict {
                node: name.to_string(),
                source,
            })?;
        contributions.retain(|_, nodes| {
            nodes.remove(name);
            !nodes.is_empty()
        });
        debug!("Evicted node bundle");
        Ok(())
    }

    fn publish(
        &self,
        contributions: &mut HashMap<ResourceId, HashSet<String>>,
        Rebuild {
            mappers,
            mut contributors,
        }: Rebuild,
    ) -> Result<(), SyncError> {
        for (node, services) in mappers.iter() {
            let key = cache::node_key(&self.config.prefix, node);
            let bundle = Arc::new(MetadataMapperBundle::new(services.clone()));
            self.cache
                .put(key, bundle, self.config.ttl)
                .map_err(|source| SyncError::Publish {
                    node: node.clone(),
                    source,
                })?;
            self.metrics.bundles_published.inc();
            trace!(%node, namespaces = services.len(), "Published bundle");
        }

        // Only after every bundle is published, record which resources the rebuilt nodes now
        // hold. Resources that no longer reference a rebuilt node stop tracking it.
        contributions.retain(|id, nodes| {
            nodes.retain(|n| !mappers.contains_key(n));
            if let Some(current) = contributors.remove(id) {
                nodes.extend(current);
            }
            !nodes.is_empty()
        });
        contributions.extend(contributors);

        Ok(())
    }

    /// The nodes each `Endpoints` resource is known to contribute to.
    pub fn contributions(&self) -> HashMap<ResourceId, HashSet<String>> {
        self.contributions.lock().clone()
    }
}

/// Builds the mapping of each node from scratch by scanning every known `Endpoints` resource.
///
/// With `all`, every node an address resolves to is built as well, not only `nodes`.
fn build_mappers(views: &crate::Views, nodes: HashSet<String>, all: bool) -> Rebuild {
    let mut rebuild = Rebuild {
        mappers: nodes
            .into_iter()
            .map(|n| (n, ServicesMapper::default()))
            .collect(),
        contributors: HashMap::default(),
    };

    for (id, addrs) in views.all_endpoints() {
        for resolved in addrs.addresses().filter_map(|a| views.resolve(a)) {
            let services = if all {
                Some(
                    rebuild
                        .mappers
                        .entry(resolved.node.to_string())
                        .or_default(),
                )
            } else {
                rebuild.mappers.get_mut(resolved.node)
            };
            if let Some(services) = services {
                services.insert(
                    resolved.pod.namespace.clone(),
                    resolved.pod.name.clone(),
                    id.name.clone(),
                );
                rebuild
                    .contributors
                    .entry(id.clone())
                    .or_default()
                    .insert(resolved.node.to_string());
            }
        }
    }

    rebuild
}
