//! SSO admin credentials.
//!
//! Read from the admin secret at the start of every pass so that a rotated
//! password is picked up without restarting the operator.

use crate::cluster::{ClusterClient, get_typed};
use crate::config::SsoSecretSource;
use crate::error::ControllerError;
use k8s_openapi::api::core::v1::Secret;
use keycloak_client::AdminCredentials;

pub const USERNAME_KEY: &str = "SSO_ADMIN_USERNAME";
pub const PASSWORD_KEY: &str = "SSO_ADMIN_PASSWORD";
pub const URL_KEY: &str = "SSO_ADMIN_URL";

/// Load the admin credentials from the secret named by `source`
pub async fn load_admin_credentials(
    cluster: &dyn ClusterClient,
    source: &SsoSecretSource,
) -> Result<AdminCredentials, ControllerError> {
    let secret_ref = source.resolve()?;
    let secret: Secret = get_typed(cluster, &secret_ref.namespace, &secret_ref.name)
        .await?
        .ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "SSO admin secret {}/{} not found",
                secret_ref.namespace, secret_ref.name
            ))
        })?;

    let username = secret_value(&secret, USERNAME_KEY)?;
    let password = secret_value(&secret, PASSWORD_KEY)?;
    let base_url = secret_value(&secret, URL_KEY)?;
    Ok(AdminCredentials {
        username,
        password,
        base_url: base_url.trim_end_matches('/').to_string(),
    })
}

fn secret_value(secret: &Secret, key: &str) -> Result<String, ControllerError> {
    let missing = || ControllerError::InvalidConfig(format!("SSO admin secret has no {key}"));
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(missing)?;
    let value = std::str::from_utf8(&bytes.0)
        .map_err(|_| ControllerError::InvalidConfig(format!("SSO admin secret {key} is not UTF-8")))?;
    if value.is_empty() {
        return Err(missing());
    }
    Ok(value.to_string())
}
