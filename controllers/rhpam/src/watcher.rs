//! Kubernetes resource watchers.
//!
//! Both kinds go through [`watch_resource`], which runs a
//! `kube_runtime::Controller` and turns each pass outcome into a requeue
//! decision. Environments also watch the Deployments they own so that the
//! database becoming ready triggers the next pass without waiting for the
//! requeue.

use crate::error::ControllerError;
use crate::reconciler::{PassOutcome, Reconciler};
use crds::{RhpamEnvironment, RhpamIdentity};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

type PassFuture = Pin<Box<dyn Future<Output = Result<PassOutcome, ControllerError>> + Send>>;

/// Run a controller for `K` until its stream ends.
///
/// `pass` receives the namespace and name of the object to reconcile.
async fn watch_resource<K, F>(
    api: Api<K>,
    owned: Option<Api<Deployment>>,
    reconciler: Arc<Reconciler>,
    pass: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + std::fmt::Debug + serde::de::DeserializeOwned + 'static,
    F: Fn(Arc<Reconciler>, String, String) -> PassFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
        ctx.error_action(&key, error)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let pass = pass.clone();
        async move {
            let namespace = obj
                .namespace()
                .ok_or(ControllerError::MissingMetadata("metadata.namespace"))?;
            let name = obj.name_any();
            debug!("Reconciling {} {}/{}", resource_name, namespace, name);
            let outcome = pass(ctx.clone(), namespace, name).await?;
            Ok::<Action, ControllerError>(ctx.action(outcome))
        }
    };

    // Debounce batches our own status writes into a single follow-up pass
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(3);

    let mut controller = Controller::new(api, watcher::Config::default()).with_config(controller_config);
    if let Some(owned) = owned {
        controller = controller.owns(owned, watcher::Config::default());
    }

    controller
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!("Reconciled {} {}", resource_name, object),
                Err(e) => error!("Controller error for {}: {}", resource_name, e),
            }
        })
        .await;

    Ok(())
}

/// Watches RhpamEnvironment and RhpamIdentity resources.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    namespace: Option<String>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// `namespace` of `None` watches the whole cluster
    pub fn new(reconciler: Arc<Reconciler>, client: Client, namespace: Option<String>) -> Self {
        Self {
            reconciler,
            client,
            namespace,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    pub async fn watch_environments(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.api::<RhpamEnvironment>(),
            Some(self.api::<Deployment>()),
            self.reconciler.clone(),
            |reconciler, namespace, name| {
                Box::pin(async move { reconciler.reconcile_environment(&namespace, &name).await })
            },
            "RhpamEnvironment",
        )
        .await
    }

    pub async fn watch_identities(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.api::<RhpamIdentity>(),
            None,
            self.reconciler.clone(),
            |reconciler, namespace, name| {
                Box::pin(async move { reconciler.reconcile_identity(&namespace, &name).await })
            },
            "RhpamIdentity",
        )
        .await
    }
}
