use anyhow::Result;
use metadata_controller_k8s_api::{self as k8s, ResourceExt};

/// Lists nodes from the Kubernetes API.
#[derive(Clone)]
pub struct ApiNodes {
    api: k8s::Api<k8s::Node>,
}

impl ApiNodes {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            api: k8s::Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl metadata_controller_core::NodeLister for ApiNodes {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        let nodes = self
            .api
            .list_metadata(&k8s::ListParams::default())
            .await?;
        Ok(nodes.items.iter().map(|n| n.name_any()).collect())
    }
}
