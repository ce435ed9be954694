//! Startup: make sure the control resource exists before any watch starts.

use tracing::{debug, info};

use crate::assets::{self, OPERATOR_CONFIG_ASSET};
use crate::controller::OperatorClient;
use crate::crd::ServiceCatalogAPIServer;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Result;

/// Parse the bundled default control resource
pub fn default_operator_config() -> Result<ServiceCatalogAPIServer> {
    Ok(serde_yaml::from_str(assets::must_asset(
        OPERATOR_CONFIG_ASSET,
    ))?)
}

/// Create `cluster` from the bundled default when absent, then block until
/// it can be read back.
pub async fn ensure_operator_config(client: &dyn OperatorClient, wait: &RetryConfig) -> Result<()> {
    match client.get().await {
        Ok(_) => {
            debug!("Operator config already exists");
            return Ok(());
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let default = default_operator_config()?;
    match client.create(&default).await {
        Ok(_) => info!("Created default operator config"),
        Err(e) if e.api_status_code() == Some(409) => {
            debug!("Operator config created concurrently");
        }
        Err(e) => return Err(e),
    }

    retry_with_backoff(wait, "wait for operator config", || client.get()).await?;
    info!("Operator config is readable");
    Ok(())
}
