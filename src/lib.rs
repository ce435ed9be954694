//! svcat-operator - convergence controller for the service catalog API server
//!
//! The operator drives the service catalog aggregated API server (a
//! node-local DaemonSet plus its RBAC, service and APIService registration)
//! toward the state declared in the cluster-scoped `ServiceCatalogAPIServer`
//! singleton named `cluster`, and reports health back through the
//! Available / Progressing / Degraded conditions on that resource.
//!
//! # Architecture
//!
//! Watch streams over every object class the operand depends on only enqueue
//! a constant key. A single worker drains the queue behind a token-bucket
//! throttle and runs one sync pass, which branches on `spec.managementState`:
//! - `Managed`: apply manifests, probe availability, aggregate status
//! - `Unmanaged`: report unknown availability, touch nothing
//! - `Removed`: strip ownership from bindings, tear down namespace and APIService
//!
//! # Modules
//!
//! - [`crd`] - ServiceCatalogAPIServer resource and condition helpers
//! - [`assets`] - bundled operand manifests
//! - [`apply`] - idempotent apply and content-hash utilities
//! - [`status`] - pure status aggregation
//! - [`controller`] - sync state machine, probe and removal sequencer
//! - [`queue`] / [`dispatcher`] / [`worker`] - work queue plumbing
//! - [`bootstrap`] - control resource creation at startup
//! - [`remover`] - one-shot cleanup job
//! - [`events`] / [`metrics`] - Kubernetes events and OpenTelemetry gauges
//! - [`config`] - runtime settings
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod apply;
pub mod assets;
pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod remover;
pub mod retry;
pub mod status;
pub mod worker;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the operand runs in
pub const TARGET_NAMESPACE: &str = "openshift-service-catalog-apiserver";

/// Namespace the operator itself runs in
pub const OPERATOR_NAMESPACE: &str = "openshift-service-catalog-apiserver-operator";

/// Namespace holding etcd client material
pub const ETCD_NAMESPACE: &str = "kube-system";

/// Namespace of the kube-apiserver configuration
pub const KUBE_APISERVER_NAMESPACE: &str = "openshift-kube-apiserver";

/// Namespace for administrator supplied global configuration
pub const USER_CONFIG_NAMESPACE: &str = "openshift-config";

/// Name of the singleton control resource
pub const OPERATOR_CONFIG_NAME: &str = "cluster";

/// Name of the operand DaemonSet
pub const DAEMON_SET_NAME: &str = "apiserver";

/// Name of the Service fronting the operand
pub const SERVICE_NAME: &str = "api";

/// Component name used for version reporting and the cluster operator
pub const COMPONENT_NAME: &str = "service-catalog-apiserver";

/// Field manager / event reporter name
pub const FIELD_MANAGER: &str = "svcat-apiserver-operator";

/// An API group/version served by the operand
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupVersion {
    /// API group, e.g. `servicecatalog.k8s.io`
    pub group: &'static str,
    /// API version, e.g. `v1beta1`
    pub version: &'static str,
}

impl GroupVersion {
    /// `apiVersion` string as it appears on objects of this group
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    /// Name of the APIService registering this group/version
    pub fn api_service_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }

    /// Discovery path for this group/version
    pub fn discovery_path(&self) -> String {
        format!("/apis/{}/{}", self.group, self.version)
    }
}

/// Service catalog API served by the operand
pub const SERVICE_CATALOG_V1BETA1: GroupVersion = GroupVersion {
    group: "servicecatalog.k8s.io",
    version: "v1beta1",
};

/// Every group/version the operand serves and the operator registers
pub const MANAGED_GROUP_VERSIONS: &[GroupVersion] = &[SERVICE_CATALOG_V1BETA1];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_version_derived_names() {
        let gv = SERVICE_CATALOG_V1BETA1;
        assert_eq!(gv.api_version(), "servicecatalog.k8s.io/v1beta1");
        assert_eq!(gv.api_service_name(), "v1beta1.servicecatalog.k8s.io");
        assert_eq!(gv.discovery_path(), "/apis/servicecatalog.k8s.io/v1beta1");
    }
}
