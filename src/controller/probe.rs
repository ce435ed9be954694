//! Live discovery probe against the operand's API groups.

use async_trait::async_trait;
use kube::client::Body;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::GroupVersion;

/// Issues discovery requests against the cluster API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiProbe: Send + Sync {
    /// HTTP status of `GET path`, 0 when no response was received
    async fn status_code(&self, path: &str) -> u16;
}

/// [`ApiProbe`] using the operator's own client
pub struct KubeApiProbe {
    client: Client,
}

impl KubeApiProbe {
    /// Create a probe using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApiProbe for KubeApiProbe {
    async fn status_code(&self, path: &str) -> u16 {
        let request = match http::Request::get(path).body(Vec::new()) {
            Ok(request) => request,
            Err(e) => {
                debug!(path, error = %e, "Invalid discovery request");
                return 0;
            }
        };
        let result = self.client.send(request.map(Body::from)).await;
        if let Err(e) = &result {
            debug!(path, error = %e, "Discovery request failed");
        }
        response_code(result)
    }
}

/// Status code of a raw response, 0 when the request never got one
fn response_code<B>(result: std::result::Result<http::Response<B>, kube::Error>) -> u16 {
    match result {
        Ok(response) => response.status().as_u16(),
        Err(kube::Error::Api(response)) => response.code,
        Err(_) => 0,
    }
}

/// One "not ready" message per group/version whose discovery is not 200
pub async fn check_for_apis(probe: &dyn ApiProbe, group_versions: &[GroupVersion]) -> Vec<String> {
    let mut missing = Vec::new();
    for gv in group_versions {
        let code = probe.status_code(&gv.discovery_path()).await;
        if code != 200 {
            missing.push(format!("{}.{} is not ready: {}", gv.version, gv.group, code));
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUPS: &[GroupVersion] = &[
        GroupVersion {
            group: "servicecatalog.k8s.io",
            version: "v1beta1",
        },
        GroupVersion {
            group: "settings.k8s.io",
            version: "v1alpha1",
        },
    ];

    /// Story: discovery answering without content is still not ready
    ///
    /// Only an actual 200 counts; other success codes are reported as-is.
    #[test]
    fn story_real_status_codes_are_reported() {
        let respond = |code: u16| {
            http::Response::builder()
                .status(code)
                .body(())
                .unwrap()
        };
        assert_eq!(response_code(Ok(respond(200))), 200);
        assert_eq!(response_code(Ok(respond(204))), 204);
        assert_eq!(response_code(Ok(respond(503))), 503);
    }

    #[test]
    fn test_failed_requests_map_to_zero_or_api_code() {
        let api = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert_eq!(response_code::<()>(Err(api)), 403);

        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(response_code::<()>(Err(kube::Error::SerdeError(decode))), 0);
    }

    #[tokio::test]
    async fn test_all_groups_serving() {
        let mut probe = MockApiProbe::new();
        probe.expect_status_code().returning(|_| 200);

        assert!(check_for_apis(&probe, GROUPS).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_200_groups_are_reported_with_code() {
        let mut probe = MockApiProbe::new();
        probe
            .expect_status_code()
            .withf(|path| path.to_string() == "/apis/servicecatalog.k8s.io/v1beta1")
            .returning(|_| 503);
        probe
            .expect_status_code()
            .withf(|path| path.to_string() == "/apis/settings.k8s.io/v1alpha1")
            .returning(|_| 0);

        let missing = check_for_apis(&probe, GROUPS).await;
        assert_eq!(
            missing,
            vec![
                "v1beta1.servicecatalog.k8s.io is not ready: 503".to_string(),
                "v1alpha1.settings.k8s.io is not ready: 0".to_string(),
            ]
        );
    }
}
