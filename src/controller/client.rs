//! Access to the `ServiceCatalogAPIServer/cluster` singleton.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::crd::ServiceCatalogAPIServer;
use crate::{Result, FIELD_MANAGER, OPERATOR_CONFIG_NAME};

/// Read-through accessor for the control resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperatorClient: Send + Sync {
    /// Fetch the current `cluster` object from the API server
    async fn get(&self) -> Result<ServiceCatalogAPIServer>;

    /// Create the control resource
    async fn create(&self, obj: &ServiceCatalogAPIServer) -> Result<ServiceCatalogAPIServer>;

    /// Replace the status of `obj`.
    ///
    /// The write is conditional on `obj.metadata.resourceVersion`; a
    /// concurrent change makes it fail with a conflict.
    async fn update_status(&self, obj: &ServiceCatalogAPIServer) -> Result<()>;

    /// Delete the control resource
    async fn delete(&self) -> Result<()>;
}

/// [`OperatorClient`] backed by the Kubernetes API
pub struct KubeOperatorClient {
    api: Api<ServiceCatalogAPIServer>,
}

impl KubeOperatorClient {
    /// Create a client for the cluster-scoped singleton
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl OperatorClient for KubeOperatorClient {
    async fn get(&self) -> Result<ServiceCatalogAPIServer> {
        Ok(self.api.get(OPERATOR_CONFIG_NAME).await?)
    }

    async fn create(&self, obj: &ServiceCatalogAPIServer) -> Result<ServiceCatalogAPIServer> {
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        Ok(self.api.create(&params, obj).await?)
    }

    async fn update_status(&self, obj: &ServiceCatalogAPIServer) -> Result<()> {
        let patch = json!({
            "metadata": { "resourceVersion": obj.metadata.resource_version },
            "status": obj.status,
        });
        self.api
            .patch_status(
                OPERATOR_CONFIG_NAME,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.api
            .delete(OPERATOR_CONFIG_NAME, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
