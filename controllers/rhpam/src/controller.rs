//! Main controller implementation.
//!
//! Builds the shared [`Reconciler`] and runs the two resource watchers next to
//! the metrics server. The process exits as soon as any of them stops.

use crate::cluster::KubeClusterClient;
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::http;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::templates::BuiltinTemplates;
use crate::watcher::Watcher;
use keycloak_client::KeycloakConnector;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main controller for RHPAM resources.
#[derive(Debug)]
pub struct Controller {
    environment_watcher: JoinHandle<Result<(), ControllerError>>,
    identity_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing RHPAM operator");

        let kube_client = Client::try_default()
            .await
            .map_err(|e| ControllerError::Cluster(e.into()))?;

        if config.insecure_skip_verify {
            warn!("TLS verification of the SSO server is disabled");
        }
        let keycloak = KeycloakConnector::new(config.insecure_skip_verify)?;
        let metrics = Metrics::new().map_err(|e| ControllerError::InvalidConfig(format!("metrics registry: {e}")))?;

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubeClusterClient::new(kube_client.clone())),
            Arc::new(keycloak),
            Arc::new(BuiltinTemplates::new(config.resource_path.clone())),
            &config,
            metrics.clone(),
        ));

        let watcher = Arc::new(Watcher::new(reconciler, kube_client, config.watch_namespace.clone()));

        let environment_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_environments().await })
        };
        let identity_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_identities().await })
        };
        let metrics_server = tokio::spawn(http::serve(config.metrics_addr, metrics));

        Ok(Self {
            environment_watcher,
            identity_watcher,
            metrics_server,
        })
    }

    /// Runs until a watcher or the metrics server exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("RHPAM operator running");

        tokio::select! {
            result = &mut self.environment_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("RhpamEnvironment watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("RhpamEnvironment watcher error: {e}")))?;
            }
            result = &mut self.identity_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("RhpamIdentity watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("RhpamIdentity watcher error: {e}")))?;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("metrics server panicked: {e}")))??;
            }
        }

        warn!("A controller task exited");
        Ok(())
    }
}
