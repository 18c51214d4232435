use anyhow::Result;

/// Enumerates the names of the cluster's nodes.
#[async_trait::async_trait]
pub trait NodeLister: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<String>>;
}

#[async_trait::async_trait]
impl NodeLister for Vec<String> {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        Ok(self.clone())
    }
}
