#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod resource_id;

pub use self::resource_id::ResourceId;
pub use k8s_openapi::api::{
    self,
    core::v1::{
        EndpointAddress, EndpointSubset, Endpoints, Node, NodeSpec, ObjectReference, Pod, PodSpec,
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Error, Resource,
};
