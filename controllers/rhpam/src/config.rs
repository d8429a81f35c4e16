//! Operator configuration read from the process environment.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const SSO_NAMESPACE_ENV: &str = "SSO_NAMESPACE";
pub const SSO_ADMIN_SECRET_ENV: &str = "SSO_ADMIN_CREDENTIALS_SECRET";

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_RESYNC_SECS: u64 = 300;

/// Process-wide settings fixed at startup
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, `None` for all namespaces
    pub watch_namespace: Option<String>,
    /// Skip TLS verification when talking to the SSO server
    pub insecure_skip_verify: bool,
    /// Bind address of the metrics/probes server
    pub metrics_addr: SocketAddr,
    /// Requeue interval for resources in a steady state
    pub resync_interval: Duration,
    /// Where to find the SSO admin secret
    pub sso_secret: SsoSecretSource,
    /// Directory holding the database init scripts and SQL schemas.
    /// `None` uses the scripts built into the binary.
    pub resource_path: Option<PathBuf>,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let insecure_skip_verify = match lookup("SSO_INSECURE_SKIP_VERIFY").as_deref() {
            None | Some("") => true,
            Some(v) => parse_bool(v).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("SSO_INSECURE_SKIP_VERIFY must be a boolean, got {v:?}"))
            })?,
        };

        let metrics_addr = lookup("METRICS_ADDR")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string())
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDR: {e}")))?;

        let resync_secs = match lookup("RESYNC_INTERVAL_SECS") {
            Some(v) => v
                .parse::<u64>()
                .map_err(|e| ControllerError::InvalidConfig(format!("RESYNC_INTERVAL_SECS: {e}")))?,
            None => DEFAULT_RESYNC_SECS,
        };

        let resource_path = lookup("RESOURCE_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            watch_namespace,
            insecure_skip_verify,
            metrics_addr,
            resync_interval: Duration::from_secs(resync_secs),
            sso_secret: SsoSecretSource::Environment,
            resource_path,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Namespace and name of the SSO admin credentials secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoSecretRef {
    pub namespace: String,
    pub name: String,
}

/// How the SSO admin secret is located on each pass.
///
/// `Environment` re-reads `SSO_NAMESPACE` and `SSO_ADMIN_CREDENTIALS_SECRET`
/// every time, so a pass fails immediately when either is unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsoSecretSource {
    Environment,
    Fixed(SsoSecretRef),
}

impl SsoSecretSource {
    pub fn resolve(&self) -> Result<SsoSecretRef, ControllerError> {
        match self {
            Self::Environment => resolve_with(|key| std::env::var(key).ok()),
            Self::Fixed(secret) => Ok(secret.clone()),
        }
    }
}

fn resolve_with(lookup: impl Fn(&str) -> Option<String>) -> Result<SsoSecretRef, ControllerError> {
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ControllerError::InvalidConfig(format!("Environment variable {key} is not set.")))
    };
    Ok(SsoSecretRef {
        namespace: required(SSO_NAMESPACE_ENV)?,
        name: required(SSO_ADMIN_SECRET_ENV)?,
    })
}
