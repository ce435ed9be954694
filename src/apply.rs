//! Idempotent apply and content-hash utilities.
//!
//! Objects are written with server-side apply under the operator's field
//! manager. The API server merges the required fields and leaves fields
//! owned by other managers (defaults, injected CA bundles) alone. An apply
//! counts as a change when the object's resourceVersion moved.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{assets, Error, Result, FIELD_MANAGER};

/// Pod template annotation bumped to force a rolling update
pub const FORCE_ROLLOUT_ANNOTATION: &str = "operator.openshift.io/force";

/// Outcome of applying one bundled manifest
#[derive(Debug)]
pub struct ApplyResult {
    /// Bundle path of the manifest
    pub file: String,
    /// Kind of the object, `Unknown` when the manifest did not parse
    pub kind: String,
    /// True when the live object was created or updated
    pub changed: bool,
    /// Set when the apply failed
    pub error: Option<Error>,
}

/// Kind of object whose content feeds a rollout hash
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashedKind {
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Secret
    Secret,
}

impl HashedKind {
    fn resource(&self) -> &'static str {
        match self {
            Self::ConfigMap => "configmaps",
            Self::Secret => "secrets",
        }
    }
}

/// Reference to an object whose content is hashed into the operand config
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashedObjectRef {
    /// ConfigMap or Secret
    pub kind: HashedKind,
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl HashedObjectRef {
    /// Reference a config map
    pub fn config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: HashedKind::ConfigMap,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference a secret
    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: HashedKind::Secret,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key under which the hash is stored: `<resource>.<namespace>.<name>`
    pub fn hash_key(&self) -> String {
        format!("{}.{}.{}", self.kind.resource(), self.namespace, self.name)
    }
}

/// Apply and hash operations against the live cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Apply bundled manifests in order, one result per file
    async fn apply_directly(&self, files: &[&'static str]) -> Vec<ApplyResult>;

    /// Apply a config map, returning the live object and whether it changed
    async fn apply_config_map(&self, required: ConfigMap) -> Result<(ConfigMap, bool)>;

    /// Apply a DaemonSet.
    ///
    /// The spec is only rewritten when metadata differs, the live generation
    /// differs from `expected_generation`, or `force_rollout` is set.
    async fn apply_daemon_set(
        &self,
        required: DaemonSet,
        expected_generation: i64,
        force_rollout: bool,
    ) -> Result<(DaemonSet, bool)>;

    /// Apply an APIService registration
    async fn apply_api_service(&self, required: APIService) -> Result<(APIService, bool)>;

    /// Hash the content of each referenced object; absent objects hash to `""`
    async fn hash_object_refs(&self, refs: &[HashedObjectRef])
        -> Result<BTreeMap<String, String>>;
}

/// [`ResourceApplier`] backed by the Kubernetes API
pub struct KubeApplier {
    client: Client,
}

impl KubeApplier {
    /// Create an applier using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply_dynamic(&self, ar: &ApiResource, required: DynamicObject) -> Result<bool> {
        let name = required.name_any();
        let api: Api<DynamicObject> = match required.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        };

        let (_, changed) = server_side_apply(&api, &name, &required).await?;
        if changed {
            info!(kind = %ar.kind, name = %name, "Applied object");
        } else {
            debug!(kind = %ar.kind, name = %name, "Object already up to date");
        }
        Ok(changed)
    }
}

#[async_trait]
impl ResourceApplier for KubeApplier {
    async fn apply_directly(&self, files: &[&'static str]) -> Vec<ApplyResult> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            let (kind, outcome) = match parse_manifest(assets::must_asset(file)) {
                Ok((ar, obj)) => (ar.kind.clone(), self.apply_dynamic(&ar, obj).await),
                Err(e) => ("Unknown".to_string(), Err(e)),
            };
            let (changed, error) = match outcome {
                Ok(changed) => (changed, None),
                Err(e) => (false, Some(e)),
            };
            results.push(ApplyResult {
                file: file.to_string(),
                kind,
                changed,
                error,
            });
        }
        results
    }

    async fn apply_config_map(&self, required: ConfigMap) -> Result<(ConfigMap, bool)> {
        let namespace = required
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::apply("config map has no namespace"))?;
        let name = required.name_any();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        let (applied, changed) = server_side_apply(&api, &name, &required).await?;
        if changed {
            info!(namespace = %namespace, name = %name, "Applied config map");
        }
        Ok((applied, changed))
    }

    async fn apply_daemon_set(
        &self,
        mut required: DaemonSet,
        expected_generation: i64,
        force_rollout: bool,
    ) -> Result<(DaemonSet, bool)> {
        let namespace = required
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::apply("daemonset has no namespace"))?;
        let name = required.name_any();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);

        if force_rollout {
            stamp_force_rollout(&mut required, uuid::Uuid::new_v4().to_string());
        }

        let live_generation = match api.get_opt(&name).await? {
            Some(existing) => {
                let generation = existing.metadata.generation.unwrap_or(0);
                if !metadata_differs(&existing.metadata, &required.metadata)
                    && generation == expected_generation
                    && !force_rollout
                {
                    debug!(namespace = %namespace, name = %name, generation, "Daemonset unchanged");
                    return Ok((existing, false));
                }
                Some(generation)
            }
            None => None,
        };

        let applied = api
            .patch(&name, &apply_params(), &Patch::Apply(&required))
            .await?;
        info!(
            namespace = %namespace,
            name = %name,
            force_rollout,
            expected_generation,
            ?live_generation,
            "Applied daemonset"
        );
        Ok((applied, true))
    }

    async fn apply_api_service(&self, required: APIService) -> Result<(APIService, bool)> {
        let name = required.name_any();
        let api: Api<APIService> = Api::all(self.client.clone());

        let (applied, changed) = server_side_apply(&api, &name, &required).await?;
        if changed {
            info!(name = %name, "Applied apiservice");
        }
        Ok((applied, changed))
    }

    async fn hash_object_refs(
        &self,
        refs: &[HashedObjectRef],
    ) -> Result<BTreeMap<String, String>> {
        let mut hashes = BTreeMap::new();
        for r in refs {
            let hash = match r.kind {
                HashedKind::ConfigMap => {
                    let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &r.namespace);
                    match api.get_opt(&r.name).await? {
                        Some(cm) => hash_content(&(&cm.data, &cm.binary_data))?,
                        None => String::new(),
                    }
                }
                HashedKind::Secret => {
                    let api: Api<Secret> = Api::namespaced(self.client.clone(), &r.namespace);
                    match api.get_opt(&r.name).await? {
                        Some(secret) => hash_content(&secret.data)?,
                        None => String::new(),
                    }
                }
            };
            hashes.insert(r.hash_key(), hash);
        }
        Ok(hashes)
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// Server-side apply `required`, reporting whether the object changed
async fn server_side_apply<K>(api: &Api<K>, name: &str, required: &K) -> Result<(K, bool)>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    let before = api.get_opt(name).await?.and_then(|live| live.resource_version());
    let applied = api
        .patch(name, &apply_params(), &Patch::Apply(required))
        .await?;
    let changed =
        resource_version_changed(before.as_deref(), applied.resource_version().as_deref());
    Ok((applied, changed))
}

/// A no-op apply leaves resourceVersion untouched; a create has no prior version
fn resource_version_changed(before: Option<&str>, after: Option<&str>) -> bool {
    before.is_none() || before != after
}

/// Parse a YAML manifest into a dynamic object and its API resource
fn parse_manifest(manifest: &str) -> Result<(ApiResource, DynamicObject)> {
    let value: Value = serde_yaml::from_str(manifest)?;
    let obj: DynamicObject = serde_json::from_value(value)?;
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| Error::apply("manifest has no apiVersion/kind"))?;
    let ar = build_api_resource(&types.api_version, &types.kind);
    Ok((ar, obj))
}

/// Build an ApiResource from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if lower.ends_with('y') {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Stamp a unique token on the pod template so the controller rolls pods
fn stamp_force_rollout(daemon_set: &mut DaemonSet, token: String) {
    daemon_set
        .spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(FORCE_ROLLOUT_ANNOTATION.to_string(), token);
}

/// True when a required label or annotation is missing or different on `live`.
///
/// Keys only present on the live object are ignored.
fn metadata_differs(live: &ObjectMeta, required: &ObjectMeta) -> bool {
    [
        (&live.labels, &required.labels),
        (&live.annotations, &required.annotations),
    ]
    .into_iter()
    .any(|(live, want)| {
        want.iter()
            .flatten()
            .any(|(key, value)| live.as_ref().and_then(|l| l.get(key)) != Some(value))
    })
}

fn hash_content<T: Serialize>(content: &T) -> Result<String> {
    let bytes = serde_json::to_vec(content)?;
    Ok(sha256_hex(&bytes))
}

/// Hex SHA-256 digest of `input`
pub fn sha256_hex(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
