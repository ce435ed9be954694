//! Teardown of the operand in the Removed state.
//!
//! Order matters: ownership markers pointing at the service catalog API are
//! stripped from binding secrets first, so the garbage collector does not
//! delete user secrets once the API disappears. Only after the operand
//! namespace is confirmed gone are the APIService registrations deleted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::{Error, GroupVersion, Result, FIELD_MANAGER, SERVICE_CATALOG_V1BETA1};

/// A ServiceBinding read without a schema
#[derive(Clone, Debug)]
pub struct DependentBinding {
    object: DynamicObject,
}

impl DependentBinding {
    /// Wrap a dynamic object
    pub fn new(object: DynamicObject) -> Self {
        Self { object }
    }

    /// Name of the binding
    pub fn name(&self) -> String {
        self.object.name_any()
    }

    /// Namespace of the binding
    pub fn namespace(&self) -> Option<String> {
        self.object.namespace()
    }

    /// String field at a dotted path below the object root, e.g. `spec.secretName`
    pub fn get_string(&self, path: &str) -> Option<&str> {
        path.split('.')
            .try_fold(&self.object.data, |value, key| value.get(key))
            .and_then(Value::as_str)
    }
}

/// Cluster operations used by the removal sequencer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemovalClient: Send + Sync {
    /// List ServiceBindings across all namespaces
    async fn list_bindings(&self) -> Result<Vec<DependentBinding>>;
    /// Fetch a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
    /// Write a secret back
    async fn update_secret(&self, secret: &Secret) -> Result<()>;
    /// Delete a namespace
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    /// Fetch a namespace
    async fn get_namespace(&self, name: &str) -> Result<Namespace>;
    /// Delete an APIService
    async fn delete_api_service(&self, name: &str) -> Result<()>;
}

/// [`RemovalClient`] backed by the Kubernetes API
pub struct KubeRemovalClient {
    client: Client,
}

impl KubeRemovalClient {
    /// Create a removal client using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn binding_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            SERVICE_CATALOG_V1BETA1.group,
            SERVICE_CATALOG_V1BETA1.version,
            "ServiceBinding",
        ))
    }
}

#[async_trait]
impl RemovalClient for KubeRemovalClient {
    async fn list_bindings(&self) -> Result<Vec<DependentBinding>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &Self::binding_resource());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(DependentBinding::new).collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::removal("secret has no namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        api.replace(&secret.name_any(), &params, secret).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn delete_api_service(&self, name: &str) -> Result<()> {
        use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;

        let api: Api<APIService> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Runs the five teardown steps in order, failing fast
pub struct RemovalSequencer {
    client: Arc<dyn RemovalClient>,
    namespace: String,
    group_versions: Vec<GroupVersion>,
    poll_interval: Duration,
    timeout: Duration,
}

impl RemovalSequencer {
    /// Create a sequencer tearing down `namespace` and the given APIServices
    pub fn new(
        client: Arc<dyn RemovalClient>,
        namespace: impl Into<String>,
        group_versions: &[GroupVersion],
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            group_versions: group_versions.to_vec(),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }

    /// Override how often and how long namespace deletion is awaited
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.timeout = timeout;
        self
    }

    /// Run the whole sequence
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn run(&self) -> Result<()> {
        self.release_binding_secrets().await?;
        self.delete_namespace().await?;
        self.wait_for_namespace_gone().await?;
        self.delete_api_services().await
    }

    /// Strip service catalog owner references from every bound secret
    async fn release_binding_secrets(&self) -> Result<()> {
        let bindings = match self.client.list_bindings().await {
            Ok(bindings) => bindings,
            Err(e) if e.is_not_found() || e.is_service_unavailable() => {
                info!(error = %e, "Service binding API is gone, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let owner_versions: Vec<String> = self
            .group_versions
            .iter()
            .map(GroupVersion::api_version)
            .collect();
        for binding in &bindings {
            let Some(secret_name) = binding.get_string("spec.secretName") else {
                warn!(binding = %binding.name(), "Binding has no secretName, nothing to release");
                continue;
            };
            let namespace = binding.namespace().unwrap_or_default();

            let mut secret = match self.client.get_secret(&namespace, secret_name).await {
                Ok(secret) => secret,
                Err(e) if e.is_not_found() => {
                    warn!(
                        binding = %binding.name(),
                        secret = %secret_name,
                        "Bound secret not found, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            if strip_owner_references(&mut secret, &owner_versions) {
                self.client.update_secret(&secret).await?;
                info!(namespace = %namespace, secret = %secret_name, "Released bound secret");
            }
        }
        Ok(())
    }

    async fn delete_namespace(&self) -> Result<()> {
        match self.client.delete_namespace(&self.namespace).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Poll until the namespace is gone or the timeout elapses
    async fn wait_for_namespace_gone(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.client.get_namespace(&self.namespace).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
                Ok(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::removal(format!(
                    "namespace {} still present after {}s, APIService deletion deferred",
                    self.namespace,
                    self.timeout.as_secs()
                )));
            }
        }
    }

    async fn delete_api_services(&self) -> Result<()> {
        for gv in &self.group_versions {
            let name = gv.api_service_name();
            match self.client.delete_api_service(&name).await {
                Err(e) if !e.is_not_found() => {
                    warn!(apiservice = %name, error = %e, "Failed to delete apiservice");
                    return Err(e);
                }
                _ => info!(apiservice = %name, "Apiservice deleted"),
            }
        }
        Ok(())
    }
}

/// Remove owner references with any of the given apiVersions; true if any were removed
fn strip_owner_references(secret: &mut Secret, api_versions: &[String]) -> bool {
    let Some(refs) = secret.metadata.owner_references.as_mut() else {
        return false;
    };
    let before = refs.len();
    refs.retain(|r| !api_versions.contains(&r.api_version));
    refs.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use crate::{MANAGED_GROUP_VERSIONS, TARGET_NAMESPACE};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::sync::Mutex;

    fn binding(namespace: &str, name: &str, secret_name: Option<&str>) -> DependentBinding {
        let mut spec = serde_json::Map::new();
        if let Some(secret_name) = secret_name {
            spec.insert("secretName".to_string(), Value::from(secret_name));
        }
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "servicecatalog.k8s.io/v1beta1",
            "kind": "ServiceBinding",
            "metadata": { "name": name, "namespace": namespace },
            "spec": spec,
        }))
        .unwrap();
        DependentBinding::new(object)
    }

    fn owner(api_version: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: "ServiceBinding".to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            ..Default::default()
        }
    }

    fn secret_with_owners(owners: Vec<OwnerReference>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("db-creds".to_string()),
                namespace: Some("app".to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sequencer(client: MockRemovalClient) -> RemovalSequencer {
        RemovalSequencer::new(Arc::new(client), TARGET_NAMESPACE, MANAGED_GROUP_VERSIONS)
    }

    #[test]
    fn test_get_string_walks_dotted_path() {
        let b = binding("app", "db", Some("db-creds"));
        assert_eq!(b.get_string("spec.secretName"), Some("db-creds"));
        assert_eq!(b.get_string("spec.missing"), None);
        assert_eq!(b.get_string("spec"), None);
        assert_eq!(b.namespace().as_deref(), Some("app"));
    }

    /// Story: only service catalog ownership is released
    ///
    /// A bound secret owned both by a ServiceBinding and by a foreign object
    /// keeps the foreign reference and is written back exactly once.
    #[tokio::test(start_paused = true)]
    async fn story_only_service_catalog_owner_refs_are_stripped() {
        let written: Arc<Mutex<Vec<Secret>>> = Arc::new(Mutex::new(Vec::new()));
        let written_clone = written.clone();

        let mut client = MockRemovalClient::new();
        client
            .expect_list_bindings()
            .returning(|| Ok(vec![binding("app", "db", Some("db-creds"))]));
        client
            .expect_get_secret()
            .withf(|ns, name| ns.to_string() == "app" && name.to_string() == "db-creds")
            .returning(|_, _| {
                Ok(secret_with_owners(vec![
                    owner("servicecatalog.k8s.io/v1beta1", "db"),
                    owner("apps/v1", "keeper"),
                ]))
            });
        client.expect_update_secret().times(1).returning(move |s| {
            written_clone.lock().unwrap().push(s.clone());
            Ok(())
        });
        client.expect_delete_namespace().returning(|_| Ok(()));
        client
            .expect_get_namespace()
            .returning(|_| Err(api_error(404, "NotFound")));
        client.expect_delete_api_service().returning(|_| Ok(()));

        sequencer(client).run().await.unwrap();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 1);
        let remaining = written[0].metadata.owner_references.as_ref().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].api_version, "apps/v1");
    }

    /// Story: teardown of an already clean cluster
    ///
    /// No bindings, namespace already gone, APIService already gone: the
    /// sequence completes in one pass without failing.
    #[tokio::test(start_paused = true)]
    async fn story_already_absent_everything_completes() {
        let mut client = MockRemovalClient::new();
        client.expect_list_bindings().returning(|| Ok(vec![]));
        client.expect_get_secret().never();
        client.expect_update_secret().never();
        client
            .expect_delete_namespace()
            .returning(|_| Err(api_error(404, "NotFound")));
        client
            .expect_get_namespace()
            .returning(|_| Err(api_error(404, "NotFound")));
        client
            .expect_delete_api_service()
            .withf(|name| name.to_string() == "v1beta1.servicecatalog.k8s.io")
            .times(1)
            .returning(|_| Err(api_error(404, "NotFound")));

        sequencer(client).run().await.unwrap();
    }

    /// Story: a vanished binding API is not an obstacle
    #[tokio::test(start_paused = true)]
    async fn story_unavailable_binding_api_means_nothing_to_release() {
        for code in [404, 503] {
            let mut client = MockRemovalClient::new();
            client
                .expect_list_bindings()
                .returning(move || Err(api_error(code, "Gone")));
            client.expect_get_secret().never();
            client.expect_delete_namespace().returning(|_| Ok(()));
            client
                .expect_get_namespace()
                .returning(|_| Err(api_error(404, "NotFound")));
            client.expect_delete_api_service().returning(|_| Ok(()));

            sequencer(client).run().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_list_errors_abort_before_any_deletion() {
        let mut client = MockRemovalClient::new();
        client
            .expect_list_bindings()
            .returning(|| Err(api_error(403, "Forbidden")));
        client.expect_delete_namespace().never();
        client.expect_delete_api_service().never();

        let err = sequencer(client).run().await.unwrap_err();
        assert_eq!(err.api_status_code(), Some(403));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bindings_without_secret_or_with_missing_secret_are_skipped() {
        let mut client = MockRemovalClient::new();
        client.expect_list_bindings().returning(|| {
            Ok(vec![
                binding("app", "no-secret", None),
                binding("app", "gone-secret", Some("gone")),
            ])
        });
        client
            .expect_get_secret()
            .times(1)
            .returning(|_, _| Err(api_error(404, "NotFound")));
        client.expect_update_secret().never();
        client.expect_delete_namespace().returning(|_| Ok(()));
        client
            .expect_get_namespace()
            .returning(|_| Err(api_error(404, "NotFound")));
        client.expect_delete_api_service().returning(|_| Ok(()));

        sequencer(client).run().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_secret_fetch_error_aborts() {
        let mut client = MockRemovalClient::new();
        client
            .expect_list_bindings()
            .returning(|| Ok(vec![binding("app", "db", Some("db-creds"))]));
        client
            .expect_get_secret()
            .returning(|_, _| Err(api_error(500, "InternalError")));
        client.expect_delete_namespace().never();

        assert!(sequencer(client).run().await.is_err());
    }

    /// Story: a stuck namespace blocks APIService deletion
    ///
    /// If the namespace outlives the poll ceiling the sequencer fails and
    /// the APIService registration is left in place for the next attempt.
    #[tokio::test(start_paused = true)]
    async fn story_stuck_namespace_times_out_and_keeps_api_services() {
        let mut client = MockRemovalClient::new();
        client.expect_list_bindings().returning(|| Ok(vec![]));
        client.expect_delete_namespace().returning(|_| Ok(()));
        client
            .expect_get_namespace()
            .returning(|_| Ok(Namespace::default()));
        client.expect_delete_api_service().never();

        let err = sequencer(client)
            .with_polling(Duration::from_secs(1), Duration::from_secs(5))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Removal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespace_poll_errors_abort() {
        let mut client = MockRemovalClient::new();
        client.expect_list_bindings().returning(|| Ok(vec![]));
        client.expect_delete_namespace().returning(|_| Ok(()));
        client
            .expect_get_namespace()
            .returning(|_| Err(api_error(500, "InternalError")));
        client.expect_delete_api_service().never();

        let err = sequencer(client).run().await.unwrap_err();
        assert_eq!(err.api_status_code(), Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespace_delete_failure_aborts() {
        let mut client = MockRemovalClient::new();
        client.expect_list_bindings().returning(|| Ok(vec![]));
        client
            .expect_delete_namespace()
            .returning(|_| Err(api_error(403, "Forbidden")));
        client.expect_get_namespace().never();
        client.expect_delete_api_service().never();

        assert!(sequencer(client).run().await.is_err());
    }

    #[test]
    fn test_strip_owner_references_reports_noop() {
        let versions = vec!["servicecatalog.k8s.io/v1beta1".to_string()];
        let mut secret = secret_with_owners(vec![owner("apps/v1", "keeper")]);
        assert!(!strip_owner_references(&mut secret, &versions));

        let mut bare = Secret::default();
        assert!(!strip_owner_references(&mut bare, &versions));
    }

    /// Story: every served version releases its ownership
    ///
    /// A sequencer registered for two versions strips owner references of
    /// both and leaves versions it does not serve alone.
    #[tokio::test(start_paused = true)]
    async fn story_owner_refs_follow_configured_group_versions() {
        let written: Arc<Mutex<Vec<Secret>>> = Arc::new(Mutex::new(Vec::new()));
        let written_clone = written.clone();

        let mut client = MockRemovalClient::new();
        client
            .expect_list_bindings()
            .returning(|| Ok(vec![binding("app", "db", Some("db-creds"))]));
        client.expect_get_secret().returning(|_, _| {
            Ok(secret_with_owners(vec![
                owner("servicecatalog.k8s.io/v1beta1", "db"),
                owner("servicecatalog.k8s.io/v1", "db"),
                owner("servicecatalog.k8s.io/v1alpha1", "old"),
            ]))
        });
        client.expect_update_secret().times(1).returning(move |s| {
            written_clone.lock().unwrap().push(s.clone());
            Ok(())
        });
        client.expect_delete_namespace().returning(|_| Ok(()));
        client
            .expect_get_namespace()
            .returning(|_| Err(api_error(404, "NotFound")));
        client.expect_delete_api_service().times(2).returning(|_| Ok(()));

        let group_versions = [
            SERVICE_CATALOG_V1BETA1,
            GroupVersion {
                group: "servicecatalog.k8s.io",
                version: "v1",
            },
        ];
        RemovalSequencer::new(Arc::new(client), TARGET_NAMESPACE, &group_versions)
            .run()
            .await
            .unwrap();

        let written = written.lock().unwrap();
        let remaining = written[0].metadata.owner_references.as_ref().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].api_version, "servicecatalog.k8s.io/v1alpha1");
    }
}
