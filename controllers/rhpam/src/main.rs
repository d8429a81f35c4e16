//! RHPAM Operator
//!
//! Provisions Red Hat Process Automation Manager environments and keeps their
//! SSO realm in line with the declared identities:
//! - RhpamEnvironment: realm, SSO clients, PostgreSQL, Business Central and
//!   KIE server, driven through a fixed phase sequence
//! - RhpamIdentity: realm roles, users and role mappings, converged on every
//!   pass

mod applier;
mod backoff;
mod cluster;
mod config;
mod controller;
mod credentials;
mod error;
mod http;
mod metrics;
mod reconciler;
mod templates;
mod token;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube and reqwest both pull in rustls; pick the provider explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting RHPAM operator");

    let config = OperatorConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Resync interval: {:?}", config.resync_interval);
    info!(
        "  Database init resources: {}",
        config
            .resource_path
            .as_ref()
            .map_or_else(|| "built in".to_string(), |p| p.display().to_string())
    );

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
