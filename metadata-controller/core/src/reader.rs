use crate::{cache, service_tag, MappingCache, MetadataMapperBundle, NodeLister};
use anyhow::Result;
use serde::{Serialize, Serializer};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::{self, Duration};

/// Read-only access to published node bundles.
#[derive(Clone, Debug)]
pub struct Reader<C> {
    cache: C,
    prefix: Arc<str>,
    list_timeout: Duration,
}

/// A cluster-wide snapshot of node bundles.
///
/// Nodes whose bundle could not be read are reported in `errors` and omitted from `nodes`.
#[derive(Debug, Default, Serialize)]
pub struct NodeBundles {
    #[serde(rename = "Nodes")]
    pub nodes: BTreeMap<String, Arc<MetadataMapperBundle>>,

    #[serde(rename = "Errors", serialize_with = "display_all")]
    pub errors: Vec<QueryError>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("listing nodes timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to list nodes: {0}")]
    ListNodes(#[source] anyhow::Error),

    #[error("failed to read bundle for node {node}: {source}")]
    Bundle {
        node: String,
        #[source]
        source: anyhow::Error,
    },
}

// === impl Reader ===

impl<C: MappingCache> Reader<C> {
    pub fn new(cache: C, prefix: impl Into<Arc<str>>, list_timeout: Duration) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
            list_timeout,
        }
    }

    /// Returns the node's bundle. A node without a published bundle has an empty mapping.
    pub fn node_bundle(&self, node: &str) -> Result<Arc<MetadataMapperBundle>> {
        let key = cache::node_key(&self.prefix, node);
        Ok(self.cache.get(&key)?.unwrap_or_default())
    }

    /// Returns the names of the Services routing to a pod, in lexicographic order.
    pub fn services_for_pod(&self, node: &str, namespace: &str, pod: &str) -> Result<Vec<String>> {
        let bundle = self.node_bundle(node)?;
        Ok(bundle
            .services_for_pod(namespace, pod)
            .map(|svcs| svcs.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Returns a `kube_service:<name>` tag for each Service routing to a pod, in lexicographic
    /// order of the Service names.
    pub fn service_tags_for_pod(
        &self,
        node: &str,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>> {
        let bundle = self.node_bundle(node)?;
        Ok(bundle
            .services_for_pod(namespace, pod)
            .map(|svcs| svcs.iter().map(|s| service_tag(s)).collect())
            .unwrap_or_default())
    }

    /// Assembles the bundles of every node known to `nodes`.
    ///
    /// Failures are collected rather than aborting the snapshot.
    pub async fn node_bundles<L>(&self, nodes: &L) -> NodeBundles
    where
        L: NodeLister + ?Sized,
    {
        let mut snapshot = NodeBundles::default();

        let names = match time::timeout(self.list_timeout, nodes.list_nodes()).await {
            Ok(Ok(names)) => names,
            Ok(Err(error)) => {
                tracing::warn!(%error, "Failed to list nodes");
                snapshot.errors.push(QueryError::ListNodes(error));
                return snapshot;
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.list_timeout, "Timed out listing nodes");
                snapshot.errors.push(QueryError::Timeout(self.list_timeout));
                return snapshot;
            }
        };

        for node in names {
            match self.node_bundle(&node) {
                Ok(bundle) => {
                    snapshot.nodes.insert(node, bundle);
                }
                Err(source) => {
                    tracing::debug!(%node, error = %source, "Failed to read bundle");
                    snapshot.errors.push(QueryError::Bundle { node, source });
                }
            }
        }

        snapshot
    }
}

fn display_all<S: Serializer>(errors: &[QueryError], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(ToString::to_string))
}
