//! Service metadata mapping
//!
//! Core types for the per-node index answering "which Services route traffic to this pod?".
//!
//! Each node has at most one [`MetadataMapperBundle`] published in a [`MappingCache`]. A bundle
//! maps namespaces to pods to the names of the Services whose `Endpoints` reference the pod:
//!
//! ```text
//! [ Node ] -> [ Namespace ] -> [ Pod ] -> { Service, ... }
//! ```
//!
//! Bundles are immutable once published. Rebuilding a node's mapping always produces a new bundle
//! that replaces the prior one in a single cache write, so readers observe either the old or the
//! new mapping and never a partially built one.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod bundle;
pub mod cache;
mod nodes;
mod reader;

pub use self::{
    bundle::{MetadataMapperBundle, PodServiceMap, ServicesMapper},
    cache::{MappingCache, TtlCache},
    nodes::NodeLister,
    reader::{NodeBundles, QueryError, Reader},
};

/// The prefix applied to every tag emitted for a Service.
pub const SERVICE_TAG_PREFIX: &str = "kube_service";

/// The default prefix for cache keys holding node bundles.
pub const DEFAULT_CACHE_PREFIX: &str = "KubernetesMetadataMapping";

/// Formats a Service name as a tag, e.g. `kube_service:nginx`.
pub fn service_tag(service: &str) -> String {
    format!("{}:{}", SERVICE_TAG_PREFIX, service)
}
