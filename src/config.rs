//! Runtime settings for the operator.

use std::num::NonZeroU32;
use std::time::Duration;

/// Settings assembled from the command line and environment
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorSettings {
    /// Operand image pull spec; the bundled image is kept when `None`
    pub image: Option<String>,
    /// Steady sync rate of the token bucket
    pub sync_permits_per_minute: NonZeroU32,
    /// Token bucket burst
    pub sync_burst: NonZeroU32,
    /// Interval between namespace-gone checks during removal
    pub removal_poll_interval: Duration,
    /// Ceiling for the namespace-gone wait during removal
    pub removal_timeout: Duration,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            image: None,
            sync_permits_per_minute: NonZeroU32::new(3).unwrap_or(NonZeroU32::MIN),
            sync_burst: NonZeroU32::new(4).unwrap_or(NonZeroU32::MIN),
            removal_poll_interval: Duration::from_secs(1),
            removal_timeout: Duration::from_secs(120),
        }
    }
}

impl OperatorSettings {
    /// Image to substitute into the DaemonSet, empty when none is configured
    pub fn image_pull_spec(&self) -> &str {
        self.image.as_deref().unwrap_or_default()
    }
}
