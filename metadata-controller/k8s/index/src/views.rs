//! Locally indexed snapshots of the `Endpoints`, `Pod`, and `Node` resources.
//!
//! The views are updated by kubert watch indexes and only retain the fields needed to attribute
//! endpoint addresses to nodes. As `Endpoints` change, their keys are enqueued for reconciliation.

use crate::{queue::WorkQueue, Key};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kubert::index::{ClusterRemoved, NamespacedRemoved};
use metadata_controller_k8s_api::{self as k8s, ResourceExt, ResourceId};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

pub type SharedViews = Arc<RwLock<Views>>;

#[derive(Debug)]
pub struct Views {
    endpoints: HashMap<ResourceId, EndpointsAddrs>,
    /// Scheduled pods and the node each runs on.
    pods: HashMap<ResourceId, String>,
    nodes: HashSet<String>,

    synced: Synced,
    ready: watch::Sender<bool>,
    queue: WorkQueue<Key>,
}

/// The ready addresses of an `Endpoints` resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct EndpointsAddrs(Vec<Address>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Address {
    node_name: Option<String>,
    /// The pod backing this address, if the target is a pod.
    pod: Option<ResourceId>,
}

/// An address attributed to a pod on a node.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Resolved<'a> {
    pub node: &'a str,
    pub pod: &'a ResourceId,
}

#[derive(Debug, Default)]
struct Synced {
    endpoints: bool,
    pods: bool,
    nodes: bool,
}

// === impl Views ===

impl Views {
    pub fn shared(queue: WorkQueue<Key>) -> SharedViews {
        let (ready, _) = watch::channel(false);
        Arc::new(RwLock::new(Self {
            endpoints: HashMap::default(),
            pods: HashMap::default(),
            nodes: HashSet::default(),
            synced: Synced::default(),
            ready,
            queue,
        }))
    }

    /// Watches whether every view has completed its initial list.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains(name)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }

    pub(crate) fn endpoints(&self, id: &ResourceId) -> Option<&EndpointsAddrs> {
        self.endpoints.get(id)
    }

    pub(crate) fn all_endpoints(&self) -> impl Iterator<Item = (&ResourceId, &EndpointsAddrs)> {
        self.endpoints.iter()
    }

    /// Attributes an address to a pod and the node it runs on.
    ///
    /// An address that names its node is attributed directly; otherwise the node is read from
    /// the referenced pod. Addresses that resolve to neither are skipped.
    pub(crate) fn resolve<'a>(&'a self, addr: &'a Address) -> Option<Resolved<'a>> {
        let pod = addr.pod.as_ref()?;
        if let Some(node) = addr.node_name.as_deref() {
            return Some(Resolved { node, pod });
        }
        match self.pods.get(pod) {
            Some(node) => Some(Resolved { node, pod }),
            None => {
                tracing::trace!(%pod, "Skipping address of unscheduled pod");
                None
            }
        }
    }

    fn mark_synced(&mut self, f: impl FnOnce(&mut Synced)) {
        f(&mut self.synced);
        let Synced {
            endpoints,
            pods,
            nodes,
        } = self.synced;
        if endpoints && pods && nodes && !*self.ready.borrow() {
            tracing::info!("Views synced");
            self.ready.send_replace(true);
        }
    }

    fn apply_endpoints(&mut self, id: ResourceId, addrs: EndpointsAddrs) {
        if self.endpoints.get(&id) == Some(&addrs) {
            tracing::trace!(%id, "Endpoints unchanged");
            return;
        }
        tracing::debug!(%id, addresses = addrs.0.len(), "Updating endpoints");
        self.endpoints.insert(id.clone(), addrs);
        self.queue.enqueue(Key::Endpoints(id));
    }

    fn delete_endpoints(&mut self, id: ResourceId) {
        if self.endpoints.remove(&id).is_some() {
            tracing::debug!(%id, "Deleted endpoints");
        }
        // Enqueue regardless of whether the resource was indexed so stale mappings are cleared.
        self.queue.enqueue(Key::Endpoints(id));
    }

    fn apply_pod(&mut self, id: ResourceId, node: Option<String>) {
        // A pod recreated under the same name may not be scheduled yet.
        let Some(node) = node else {
            self.delete_pod(id);
            return;
        };
        if self.pods.get(&id) == Some(&node) {
            return;
        }
        tracing::trace!(pod = %id, %node, "Pod scheduled");
        self.pods.insert(id.clone(), node);
        self.requeue_endpoints_of(&id);
    }

    fn delete_pod(&mut self, id: ResourceId) {
        if self.pods.remove(&id).is_some() {
            self.requeue_endpoints_of(&id);
        }
    }

    /// Enqueues the endpoints that depend on the pod's node assignment, i.e. those that reference
    /// the pod without naming a node.
    fn requeue_endpoints_of(&self, pod: &ResourceId) {
        for (id, addrs) in self.endpoints.iter() {
            if addrs
                .0
                .iter()
                .any(|a| a.node_name.is_none() && a.pod.as_ref() == Some(pod))
            {
                self.queue.enqueue(Key::Endpoints(id.clone()));
            }
        }
    }

    fn apply_node(&mut self, name: String) {
        if self.nodes.insert(name.clone()) {
            tracing::debug!(%name, "Adding node");
        }
    }

    fn delete_node(&mut self, name: String) {
        if self.nodes.remove(&name) {
            tracing::debug!(%name, "Deleted node");
        }
        self.queue.enqueue(Key::Node(name));
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Views {
    fn apply(&mut self, endpoints: k8s::Endpoints) {
        let Some(id) = ResourceId::of(&endpoints) else {
            tracing::warn!(name = %endpoints.name_any(), "Endpoints must be namespaced");
            return;
        };
        let addrs = EndpointsAddrs::from_resource(&id.namespace, endpoints);
        self.apply_endpoints(id, addrs);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_endpoints(ResourceId::new(namespace, name));
    }

    fn reset(&mut self, resources: Vec<k8s::Endpoints>, removed: NamespacedRemoved) {
        tracing::debug!(
            endpoints = resources.len(),
            removed = removed.values().map(|names| names.len()).sum::<usize>(),
            "Resetting endpoints"
        );
        for endpoints in resources {
            kubert::index::IndexNamespacedResource::apply(self, endpoints);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete_endpoints(ResourceId::new(namespace.clone(), name));
            }
        }
        self.mark_synced(|s| s.endpoints = true);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Views {
    fn apply(&mut self, pod: k8s::Pod) {
        let Some(id) = ResourceId::of(&pod) else {
            return;
        };
        let node = pod.spec.and_then(|spec| spec.node_name);
        self.apply_pod(id, node);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_pod(ResourceId::new(namespace, name));
    }

    fn reset(&mut self, resources: Vec<k8s::Pod>, removed: NamespacedRemoved) {
        for pod in resources {
            kubert::index::IndexNamespacedResource::apply(self, pod);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete_pod(ResourceId::new(namespace.clone(), name));
            }
        }
        self.mark_synced(|s| s.pods = true);
    }
}

impl kubert::index::IndexClusterResource<k8s::Node> for Views {
    fn apply(&mut self, node: k8s::Node) {
        self.apply_node(node.name_unchecked());
    }

    fn delete(&mut self, name: String) {
        self.delete_node(name);
    }

    fn reset(&mut self, resources: Vec<k8s::Node>, removed: ClusterRemoved) {
        for node in resources {
            self.apply_node(node.name_unchecked());
        }
        for name in removed {
            self.delete_node(name);
        }
        self.mark_synced(|s| s.nodes = true);
    }
}

// === impl EndpointsAddrs ===

impl EndpointsAddrs {
    /// Indexes the ready addresses of an `Endpoints` resource. Pod references without a namespace
    /// refer to the resource's namespace.
    fn from_resource(namespace: &str, endpoints: k8s::Endpoints) -> Self {
        let addrs = endpoints
            .subsets
            .into_iter()
            .flatten()
            .flat_map(|subset| subset.addresses.into_iter().flatten())
            .map(|addr| Address::from_resource(namespace, addr))
            .collect();
        Self(addrs)
    }

    pub(crate) fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.0.iter()
    }
}

// === impl Address ===

impl Address {
    fn from_resource(namespace: &str, addr: k8s::EndpointAddress) -> Self {
        let pod = addr.target_ref.and_then(|target| {
            if target.kind.as_deref() != Some("Pod") {
                return None;
            }
            let ns = target.namespace.unwrap_or_else(|| namespace.to_string());
            Some(ResourceId::new(ns, target.name?))
        });
        Self {
            node_name: addr.node_name.filter(|n| !n.is_empty()),
            pod,
        }
    }
}

/// Lists nodes from the local node view.
#[derive(Clone, Debug)]
pub struct ViewNodes(pub SharedViews);

#[async_trait::async_trait]
impl metadata_controller_core::NodeLister for ViewNodes {
    async fn list_nodes(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.read().node_names())
    }
}
