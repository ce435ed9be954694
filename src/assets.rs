//! Bundled manifests for the service catalog API server.
//!
//! Every manifest the operator applies is compiled into the binary and
//! looked up by its bundle path, e.g. `v3.11.0/openshift-svcat-apiserver/sa.yaml`.

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ConfigMap;

use crate::Result;

macro_rules! bundle {
    ($($file:literal),* $(,)?) => {
        &[$((
            concat!("v3.11.0/openshift-svcat-apiserver/", $file),
            include_str!(concat!("../assets/v3.11.0/openshift-svcat-apiserver/", $file)),
        )),*]
    };
}

static ASSETS: &[(&str, &str)] = bundle!(
    "ns.yaml",
    "svc.yaml",
    "sa.yaml",
    "cr-aggregate-to-admin.yaml",
    "cr-aggregate-to-edit.yaml",
    "cr-aggregate-to-view.yaml",
    "crb-auth-delegator-binding.yaml",
    "cr-namespace-viewer.yaml",
    "crb-namespace-viewer-binding.yaml",
    "cr-readiness-probe.yaml",
    "crb-readiness-binding.yaml",
    "cr-sar-creator.yaml",
    "crb-sar-creator-binding.yaml",
    "cr-serviceclass-viewer.yaml",
    "crb-serviceclass-viewer-binding.yaml",
    "rolebinding-extension-apiserver-auth-reader.yaml",
    "role-extension-apiserver-auth-reader.yaml",
    "cm.yaml",
    "ds.yaml",
    "operator-config.yaml",
);

/// Static objects applied as-is on every managed sync, in apply order
pub const STATIC_ASSETS: &[&str] = &[
    "v3.11.0/openshift-svcat-apiserver/ns.yaml",
    "v3.11.0/openshift-svcat-apiserver/svc.yaml",
    "v3.11.0/openshift-svcat-apiserver/sa.yaml",
    "v3.11.0/openshift-svcat-apiserver/cr-aggregate-to-admin.yaml",
    "v3.11.0/openshift-svcat-apiserver/cr-aggregate-to-edit.yaml",
    "v3.11.0/openshift-svcat-apiserver/cr-aggregate-to-view.yaml",
    "v3.11.0/openshift-svcat-apiserver/crb-auth-delegator-binding.yaml",
    "v3.11.0/openshift-svcat-apiserver/cr-namespace-viewer.yaml",
    "v3.11.0/openshift-svcat-apiserver/crb-namespace-viewer-binding.yaml",
    "v3.11.0/openshift-svcat-apiserver/cr-readiness-probe.yaml",
    "v3.11.0/openshift-svcat-apiserver/crb-readiness-binding.yaml",
    "v3.11.0/openshift-svcat-apiserver/cr-sar-creator.yaml",
    "v3.11.0/openshift-svcat-apiserver/crb-sar-creator-binding.yaml",
    "v3.11.0/openshift-svcat-apiserver/cr-serviceclass-viewer.yaml",
    "v3.11.0/openshift-svcat-apiserver/crb-serviceclass-viewer-binding.yaml",
    "v3.11.0/openshift-svcat-apiserver/rolebinding-extension-apiserver-auth-reader.yaml",
    "v3.11.0/openshift-svcat-apiserver/role-extension-apiserver-auth-reader.yaml",
];

/// Static objects whose change forces a rollout of the DaemonSet
pub const REDEPLOY_TRIGGERS: &[&str] = &["v3.11.0/openshift-svcat-apiserver/sa.yaml"];

/// Generated config map template
pub const CONFIG_MAP_ASSET: &str = "v3.11.0/openshift-svcat-apiserver/cm.yaml";

/// Operand DaemonSet template
pub const DAEMON_SET_ASSET: &str = "v3.11.0/openshift-svcat-apiserver/ds.yaml";

/// Default control resource created at bootstrap
pub const OPERATOR_CONFIG_ASSET: &str = "v3.11.0/openshift-svcat-apiserver/operator-config.yaml";

/// Look up a bundled manifest by path
pub fn asset(name: &str) -> Option<&'static str> {
    ASSETS
        .iter()
        .find(|(path, _)| *path == name)
        .map(|(_, contents)| *contents)
}

/// Look up a bundled manifest that must exist.
///
/// # Panics
///
/// Panics when `name` is not in the bundle. Asset names are compile-time
/// constants, so a miss is a programming error.
pub fn must_asset(name: &str) -> &'static str {
    match asset(name) {
        Some(contents) => contents,
        None => panic!("asset {name} not found in bundle"),
    }
}

/// Parse a bundled manifest as a DaemonSet
pub fn read_daemon_set(name: &str) -> Result<DaemonSet> {
    Ok(serde_yaml::from_str(must_asset(name))?)
}

/// Parse a bundled manifest as a ConfigMap
pub fn read_config_map(name: &str) -> Result<ConfigMap> {
    Ok(serde_yaml::from_str(must_asset(name))?)
}
