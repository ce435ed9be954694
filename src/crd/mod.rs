//! Custom Resource Definitions for the service catalog API server operator

mod service_catalog_apiserver;
mod types;

pub use service_catalog_apiserver::{
    ServiceCatalogAPIServer, ServiceCatalogAPIServerSpec, ServiceCatalogAPIServerStatus,
};
pub use types::{
    expected_generation, find_condition, is_condition_false, is_condition_true, set_generation,
    set_operator_condition, ConditionStatus, GenerationStatus, LogLevel, ManagementState,
    OperatorCondition, CONDITION_AVAILABLE, CONDITION_DEGRADED, CONDITION_PROGRESSING,
};
