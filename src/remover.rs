//! One-shot cleanup job run after the operator is uninstalled.
//!
//! Leaves a Managed operand alone. Otherwise deletes the operator's own
//! namespace, the control resource, its ClusterOperator and its RBAC.
//! Individual deletions are best effort: not-found is expected and any
//! other failure is logged without stopping the rest of the cleanup.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, DeleteParams, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{error, info, warn};

use crate::controller::OperatorClient;
use crate::crd::ManagementState;
use crate::{Result, COMPONENT_NAME, OPERATOR_NAMESPACE};

/// Name shared by the operator's ClusterRole and ClusterRoleBinding
pub const OPERATOR_RBAC_NAME: &str = "openshift-service-catalog-apiserver-operator";

/// What the job ended up doing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoverOutcome {
    /// The operand is Managed; nothing was touched
    Aborted,
    /// Cleanup ran
    Cleaned,
    /// Unrecognized management state; nothing was touched
    UnknownState,
}

/// Cluster-scoped deletions used by the remover
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoverClient: Send + Sync {
    /// Delete a namespace
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    /// Delete a `config.openshift.io/v1` ClusterOperator
    async fn delete_cluster_operator(&self, name: &str) -> Result<()>;
    /// Delete a ClusterRole
    async fn delete_cluster_role(&self, name: &str) -> Result<()>;
    /// Delete a ClusterRoleBinding
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;
}

/// [`RemoverClient`] backed by the Kubernetes API
pub struct KubeRemoverClient {
    client: Client,
}

impl KubeRemoverClient {
    /// Create a new remover client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoverClient for KubeRemoverClient {
    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_cluster_operator(&self, name: &str) -> Result<()> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterOperator");
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

fn log_failure(result: Result<()>, what: &str) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => error!(object = what, error = %e, "Removal failed"),
    }
}

async fn delete_cluster_scoped(client: &dyn RemoverClient) {
    info!(namespace = OPERATOR_NAMESPACE, "Removing operator namespace");
    log_failure(
        client.delete_namespace(OPERATOR_NAMESPACE).await,
        "namespace",
    );

    info!(name = COMPONENT_NAME, "Removing cluster operator");
    log_failure(
        client.delete_cluster_operator(COMPONENT_NAME).await,
        "clusteroperator",
    );

    info!(name = OPERATOR_RBAC_NAME, "Removing operator RBAC");
    log_failure(
        client.delete_cluster_role_binding(OPERATOR_RBAC_NAME).await,
        "clusterrolebinding",
    );
    log_failure(
        client.delete_cluster_role(OPERATOR_RBAC_NAME).await,
        "clusterrole",
    );
}

/// Run the cleanup job
pub async fn run_remover(
    operator: &dyn OperatorClient,
    client: &dyn RemoverClient,
) -> Result<RemoverOutcome> {
    let config = match operator.get().await {
        Ok(config) => config,
        Err(e) if e.is_not_found() => {
            info!("Operator config already removed");
            delete_cluster_scoped(client).await;
            return Ok(RemoverOutcome::Cleaned);
        }
        Err(e) => return Err(e),
    };

    match &config.spec.management_state {
        ManagementState::Managed => {
            warn!("Operand is Managed, aborting removal");
            Ok(RemoverOutcome::Aborted)
        }
        state @ (ManagementState::Unmanaged | ManagementState::Removed) => {
            info!(state = %state, "Removing operator");
            log_failure(operator.delete().await, "servicecatalogapiserver");
            delete_cluster_scoped(client).await;
            Ok(RemoverOutcome::Cleaned)
        }
        other => {
            error!(state = %other, "Unknown management state");
            Ok(RemoverOutcome::UnknownState)
        }
    }
}
