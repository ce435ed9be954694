//! ServiceCatalogAPIServer Custom Resource Definition
//!
//! The cluster-scoped singleton `cluster` carries the administrator's intent
//! for the service catalog API server (management state, log level) and the
//! operator-owned status block.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{GenerationStatus, LogLevel, ManagementState, OperatorCondition};

/// Specification for the service catalog API server operand
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.openshift.io",
    version = "v1",
    kind = "ServiceCatalogAPIServer",
    plural = "servicecatalogapiservers",
    status = "ServiceCatalogAPIServerStatus",
    namespaced = false,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.managementState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCatalogAPIServerSpec {
    /// Managed, Unmanaged or Removed
    #[serde(default)]
    #[schemars(with = "String")]
    pub management_state: ManagementState,

    /// Operand verbosity: Normal, Debug, Trace or TraceAll
    #[serde(default)]
    #[schemars(with = "String")]
    pub log_level: LogLevel,
}

/// Status written exclusively by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCatalogAPIServerStatus {
    /// `metadata.generation` at the end of the last managed pass
    #[serde(default)]
    pub observed_generation: i64,

    /// Available / Progressing / Degraded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<OperatorCondition>,

    /// Generation snapshots of applied workload objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generations: Vec<GenerationStatus>,
}

impl ServiceCatalogAPIServer {
    /// Status, or an empty one when the resource has never been reconciled
    pub fn status_or_default(&self) -> ServiceCatalogAPIServerStatus {
        self.status.clone().unwrap_or_default()
    }

    /// `metadata.generation`, 0 when the server has not assigned one
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }
}
