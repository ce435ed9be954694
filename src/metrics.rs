//! Operator metrics.
//!
//! Gauges are created from a [`Meter`] handed in at startup and reached
//! through the [`MetricsReporter`] trait, so the sync pass never touches a
//! process-wide registry directly.

use opentelemetry::metrics::{Gauge, Meter};
use opentelemetry::KeyValue;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

/// Version details of the running operator binary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    /// Major version
    pub major: String,
    /// Minor version
    pub minor: String,
    /// Commit the binary was built from
    pub git_commit: String,
    /// Full version string
    pub git_version: String,
}

impl BuildInfo {
    /// Build info of this binary
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").to_string(),
            minor: env!("CARGO_PKG_VERSION_MINOR").to_string(),
            git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            git_version: concat!("v", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Sink for the operator's reportable state
#[cfg_attr(test, automock)]
pub trait MetricsReporter: Send + Sync {
    /// The operand is managed and should be running
    fn record_enabled(&self);
    /// The operand has been removed
    fn record_disabled(&self);
    /// Observed version of a managed component
    fn record_version(&self, component: &str, version: &str);
    /// Version of the operator binary
    fn record_build_info(&self, info: &BuildInfo);
}

/// [`MetricsReporter`] recording OpenTelemetry gauges
pub struct OtelMetricsReporter {
    enabled: Gauge<i64>,
    operand_version: Gauge<i64>,
    build_info: Gauge<i64>,
}

impl OtelMetricsReporter {
    /// Create the gauges on `meter`
    pub fn new(meter: &Meter) -> Self {
        Self {
            enabled: meter
                .i64_gauge("service_catalog_apiserver_enabled")
                .with_description("Indicates whether Service Catalog apiserver is enabled")
                .build(),
            operand_version: meter
                .i64_gauge("service_catalog_apiserver_operand_version")
                .with_description("Observed version of each managed component")
                .build(),
            build_info: meter
                .i64_gauge("openshift_cluster_svcat_apiserver_operator_build_info")
                .with_description(
                    "A metric with a constant '1' value labeled by major, minor, git commit & git version from which the operator was built.",
                )
                .build(),
        }
    }
}

impl MetricsReporter for OtelMetricsReporter {
    fn record_enabled(&self) {
        self.enabled.record(1, &[]);
    }

    fn record_disabled(&self) {
        self.enabled.record(0, &[]);
    }

    fn record_version(&self, component: &str, version: &str) {
        debug!(component, version, "Recording operand version");
        self.operand_version.record(
            1,
            &[
                KeyValue::new("component", component.to_string()),
                KeyValue::new("version", version.to_string()),
            ],
        );
    }

    fn record_build_info(&self, info: &BuildInfo) {
        self.build_info.record(
            1,
            &[
                KeyValue::new("major", info.major.clone()),
                KeyValue::new("minor", info.minor.clone()),
                KeyValue::new("gitCommit", info.git_commit.clone()),
                KeyValue::new("gitVersion", info.git_version.clone()),
            ],
        );
    }
}

/// Reporter that records nothing
pub struct NoopMetricsReporter;

impl MetricsReporter for NoopMetricsReporter {
    fn record_enabled(&self) {}
    fn record_disabled(&self) {}
    fn record_version(&self, _component: &str, _version: &str) {}
    fn record_build_info(&self, _info: &BuildInfo) {}
}
