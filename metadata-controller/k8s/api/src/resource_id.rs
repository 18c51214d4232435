use kube::ResourceExt;
use std::fmt;

/// Identifies a namespaced resource.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the ID of a namespaced resource, or `None` if the resource has no namespace.
    pub fn of<R: ResourceExt>(resource: &R) -> Option<Self> {
        Some(Self::new(resource.namespace()?, resource.name_any()))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
