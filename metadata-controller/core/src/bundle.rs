use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Pod name -> names of the Services that select it.
pub type PodServiceMap = BTreeMap<String, BTreeSet<String>>;

/// Namespace -> pod -> Service names.
///
/// Only populated entries exist: a namespace is present only while it holds at least one pod, and
/// a pod only while at least one Service references it. Ordered maps keep iteration and
/// serialization stable across rebuilds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServicesMapper(BTreeMap<String, PodServiceMap>);

/// A node's published mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMapperBundle {
    pub services: ServicesMapper,
}

// === impl ServicesMapper ===

impl ServicesMapper {
    /// Records that `service` routes to `pod` in `namespace`.
    ///
    /// Returns false if the association was already known.
    pub fn insert(
        &mut self,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        service: impl Into<String>,
    ) -> bool {
        self.0
            .entry(namespace.into())
            .or_default()
            .entry(pod.into())
            .or_default()
            .insert(service.into())
    }

    pub fn services_for_pod(&self, namespace: &str, pod: &str) -> Option<&BTreeSet<String>> {
        self.0.get(namespace)?.get(pod)
    }

    pub fn namespace(&self, namespace: &str) -> Option<&PodServiceMap> {
        self.0.get(namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, PodServiceMap)> for ServicesMapper {
    fn from_iter<I: IntoIterator<Item = (String, PodServiceMap)>>(iter: I) -> Self {
        Self(iter.into_iter().filter(|(_, pods)| !pods.is_empty()).collect())
    }
}

impl From<BTreeMap<String, PodServiceMap>> for ServicesMapper {
    fn from(by_ns: BTreeMap<String, PodServiceMap>) -> Self {
        by_ns.into_iter().collect()
    }
}

// === impl MetadataMapperBundle ===

impl MetadataMapperBundle {
    pub fn new(services: ServicesMapper) -> Self {
        Self { services }
    }

    /// Returns the Services that route to the given pod, if any.
    pub fn services_for_pod(&self, namespace: &str, pod: &str) -> Option<&BTreeSet<String>> {
        self.services.services_for_pod(namespace, pod)
    }
}
