//! Service metadata index
//!
//! Maintains, for each node, the Services that route to each of the node's pods. It watches the
//! following cluster resources:
//!
//! - Each `Endpoints` resource lists the addresses backing the Service of the same name. Ready
//!   addresses that reference a pod are attributed to a node.
//! - A `Pod` supplies the node for addresses that do not name one.
//! - A `Node` deletion evicts the node's published bundle.
//!
//! ```text
//! [ Endpoints ] -> [ Address ] -> [ Pod ] -> [ Node ]
//! ```
//!
//! Watch events update the [`Views`] and enqueue keys on a [`WorkQueue`]. Workers take one key at
//! a time and the [`Reconciler`] rebuilds the affected node bundles from the views before
//! publishing each bundle to the mapping cache in a single write.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod controller;
pub mod metrics;
mod nodes;
pub mod queue;
mod reconcile;
mod views;


pub use self::{
    metrics::{QueueMetrics, ReconcileMetrics},
    nodes::ApiNodes,
    queue::{Backoff, WorkQueue},
    reconcile::{CacheConfig, Reconciler, SyncError},
    views::{SharedViews, ViewNodes, Views},
};
use metadata_controller_k8s_api::ResourceId;

/// A unit of reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// An `Endpoints` resource changed or was deleted.
    Endpoints(ResourceId),

    /// A node was deleted.
    Node(String),
}
