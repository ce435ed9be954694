//! Error types for the service catalog API server operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Applying a manifest to the cluster failed
    #[error("apply error: {0}")]
    Apply(String),

    /// The removal sequence could not complete
    #[error("removal error: {0}")]
    Removal(String),

    /// One or more steps of a managed sync failed
    ///
    /// Every message collected during the pass is kept so that a single
    /// reconciliation surfaces all independent failures at once.
    #[error("sync failed: {}", .0.join("; "))]
    Sync(Vec<String>),
}

impl Error {
    /// Create an apply error with the given message
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create a removal error with the given message
    pub fn removal(msg: impl Into<String>) -> Self {
        Self::Removal(msg.into())
    }

    /// HTTP status code of the underlying API error, if any
    pub fn api_status_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    /// Returns true if the API server reported the object as absent
    pub fn is_not_found(&self) -> bool {
        self.api_status_code() == Some(404)
    }

    /// Returns true if the API server reported the backing API as unavailable
    pub fn is_service_unavailable(&self) -> bool {
        self.api_status_code() == Some(503)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Build a `kube::Error::Api` with the given status code.
///
/// Used by tests to simulate API server responses.
#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("simulated {reason}"),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: teardown treats absent objects as already removed
    #[test]
    fn story_not_found_is_recognized_from_api_status() {
        assert!(api_error(404, "NotFound").is_not_found());

        assert!(!api_error(409, "Conflict").is_not_found());
        assert!(!Error::removal("timed out").is_not_found());
        assert!(!Error::apply("namespace \"x\" not found").is_not_found());
    }

    /// Story: a shut down aggregated API reports 503 when listing bindings
    #[test]
    fn story_service_unavailable_is_recognized() {
        assert!(api_error(503, "ServiceUnavailable").is_service_unavailable());
        assert!(!api_error(500, "InternalError").is_service_unavailable());
        assert!(!Error::removal("ServiceBinding list failed").is_service_unavailable());
    }

    /// Story: a failed managed pass reports every collected failure
    #[test]
    fn story_sync_error_joins_all_messages() {
        let err = Error::Sync(vec![
            "\"sa.yaml\" (ServiceAccount): forbidden".to_string(),
            "\"configmap\": etcd-client missing".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("sync failed: "));
        assert!(text.contains("forbidden"));
        assert!(text.contains("etcd-client missing"));
    }

    #[test]
    fn test_serde_errors_become_serialization_errors() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::Serialization(_)));

        let yaml_err = serde_yaml::from_str::<serde_json::Value>("a: [").unwrap_err();
        assert!(matches!(Error::from(yaml_err), Error::Serialization(_)));
    }
}
