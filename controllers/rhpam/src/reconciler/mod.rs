//! Reconciliation logic for RHPAM resources.
//!
//! One pass of either kind fetches the resource, runs the handler for its
//! current phase (or the teardown path when it is being deleted), persists the
//! returned status and reports a [`PassOutcome`] that the watcher turns into a
//! requeue decision. Handlers live in `environment.rs` and `identity.rs`.

pub mod convergence;
mod environment;
mod identity;
pub mod phases;
pub mod principals;

#[cfg(test)]
mod environment_test;
#[cfg(test)]
mod identity_test;

use crate::applier::ResourceApplier;
use crate::backoff::BackoffTracker;
use crate::cluster::{ClusterClient, api_resource};
use crate::config::{OperatorConfig, SsoSecretSource};
use crate::credentials::load_admin_credentials;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::templates::TemplateRenderer;
use crate::token::TokenGenerator;
use chrono::{DateTime, Utc};
use crds::{
    EnvironmentPhase, FINALIZER, IdentityPhase, RhpamEnvironment, RhpamEnvironmentStatus, RhpamIdentity,
    RhpamIdentityStatus,
};
use keycloak_client::{KeycloakClientFactory, KeycloakClientTrait};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use phases::{PhaseTable, check_transition};
use principals::DefaultPrincipals;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// Requeue delay after a pass that moved the phase forward
pub const PROGRESS_REQUEUE: Duration = Duration::from_secs(2);
/// Requeue delay while waiting on something outside the operator
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

/// Result of one successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The phase moved forward
    Progressed,
    /// Waiting on an external condition; phase unchanged
    NotReady,
    /// Steady state that is re-checked periodically
    Steady,
    /// Nothing left to do until the resource changes
    Done,
}

impl PassOutcome {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Progressed => "progressed",
            Self::NotReady => "not_ready",
            Self::Steady => "steady",
            Self::Done => "done",
        }
    }
}

/// What a phase handler asks the scheduler to do
#[derive(Debug)]
pub(crate) enum Step<S> {
    Advance(S),
    Steady(S),
    NotReady,
    Idle,
}

/// Glue between a CRD and its phase table
pub(crate) trait PhasedResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Send + Sync + 'static
{
    type Status: Clone + Default + PartialEq + Serialize + Send + Sync;
    type Phase: PhaseTable;

    fn current_status(&self) -> Self::Status;
    fn phase(status: &Self::Status) -> Self::Phase;
    fn set_phase(status: &mut Self::Status, phase: Self::Phase);
    fn set_transition_time(status: &mut Self::Status, at: DateTime<Utc>);
}

impl PhasedResource for RhpamEnvironment {
    type Status = RhpamEnvironmentStatus;
    type Phase = EnvironmentPhase;

    fn current_status(&self) -> Self::Status {
        self.status.clone().unwrap_or_default()
    }

    fn phase(status: &Self::Status) -> Self::Phase {
        status.phase
    }

    fn set_phase(status: &mut Self::Status, phase: Self::Phase) {
        status.phase = phase;
    }

    fn set_transition_time(status: &mut Self::Status, at: DateTime<Utc>) {
        status.last_transition_time = Some(at);
    }
}

impl PhasedResource for RhpamIdentity {
    type Status = RhpamIdentityStatus;
    type Phase = IdentityPhase;

    fn current_status(&self) -> Self::Status {
        self.status.clone().unwrap_or_default()
    }

    fn phase(status: &Self::Status) -> Self::Phase {
        status.phase
    }

    fn set_phase(status: &mut Self::Status, phase: Self::Phase) {
        status.phase = phase;
    }

    fn set_transition_time(status: &mut Self::Status, at: DateTime<Utc>) {
        status.last_transition_time = Some(at);
    }
}

/// Drives both resource kinds.
pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
    keycloak: Arc<dyn KeycloakClientFactory>,
    templates: Arc<dyn TemplateRenderer>,
    applier: ResourceApplier,
    principals: DefaultPrincipals,
    tokens: Mutex<TokenGenerator>,
    backoff: BackoffTracker,
    sso_secret: SsoSecretSource,
    resync_interval: Duration,
    metrics: Metrics,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("principals", &self.principals)
            .field("sso_secret", &self.sso_secret)
            .field("resync_interval", &self.resync_interval)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        keycloak: Arc<dyn KeycloakClientFactory>,
        templates: Arc<dyn TemplateRenderer>,
        config: &OperatorConfig,
        metrics: Metrics,
    ) -> Self {
        let applier = ResourceApplier::new(cluster.clone(), templates.clone());
        Self {
            cluster,
            keycloak,
            templates,
            applier,
            principals: DefaultPrincipals::default(),
            tokens: Mutex::new(TokenGenerator::default()),
            backoff: BackoffTracker::default(),
            sso_secret: config.sso_secret.clone(),
            resync_interval: config.resync_interval,
            metrics,
        }
    }

    #[must_use]
    pub fn with_principals(mut self, principals: DefaultPrincipals) -> Self {
        self.principals = principals;
        self
    }

    #[must_use]
    pub fn with_token_generator(mut self, tokens: TokenGenerator) -> Self {
        self.tokens = Mutex::new(tokens);
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Requeue decision for a successful pass
    pub fn action(&self, outcome: PassOutcome) -> Action {
        match outcome {
            PassOutcome::Progressed => Action::requeue(PROGRESS_REQUEUE),
            PassOutcome::NotReady => Action::requeue(NOT_READY_REQUEUE),
            PassOutcome::Steady => Action::requeue(self.resync_interval),
            PassOutcome::Done => Action::await_change(),
        }
    }

    /// Requeue decision after a failed pass of `key`
    pub fn error_action(&self, key: &str, error: &ControllerError) -> Action {
        let delay = self.backoff.next_delay(key);
        error!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, error);
        Action::requeue(delay)
    }

    /// One pass over the `RhpamEnvironment` at `namespace/name`
    pub async fn reconcile_environment(&self, namespace: &str, name: &str) -> Result<PassOutcome, ControllerError> {
        let result = self.environment_pass(namespace, name).await;
        self.record_pass(EnvironmentPhase::KIND, &format!("{namespace}/{name}"), &result);
        result
    }

    /// One pass over the `RhpamIdentity` at `namespace/name`
    pub async fn reconcile_identity(&self, namespace: &str, name: &str) -> Result<PassOutcome, ControllerError> {
        let result = self.identity_pass(namespace, name).await;
        self.record_pass(IdentityPhase::KIND, &format!("{namespace}/{name}"), &result);
        result
    }

    async fn environment_pass(&self, namespace: &str, name: &str) -> Result<PassOutcome, ControllerError> {
        let Some(env) = crate::cluster::get_typed::<RhpamEnvironment>(self.cluster.as_ref(), namespace, name).await?
        else {
            debug!("RhpamEnvironment {}/{} is gone", namespace, name);
            return Ok(PassOutcome::Done);
        };

        if env.meta().deletion_timestamp.is_some() {
            if !env.finalizers().iter().any(|f| f == FINALIZER) {
                return Ok(PassOutcome::Done);
            }
            let result = self.deprovision_environment(&env).await;
            return self.finish_teardown(&env, result).await;
        }

        let status = env.current_status();
        let step = self.environment_step(&env, status).await?;
        self.apply_step(&env, step).await
    }

    async fn identity_pass(&self, namespace: &str, name: &str) -> Result<PassOutcome, ControllerError> {
        let Some(identity) = crate::cluster::get_typed::<RhpamIdentity>(self.cluster.as_ref(), namespace, name).await?
        else {
            debug!("RhpamIdentity {}/{} is gone", namespace, name);
            return Ok(PassOutcome::Done);
        };

        if identity.meta().deletion_timestamp.is_some() {
            if !identity.finalizers().iter().any(|f| f == FINALIZER) {
                return Ok(PassOutcome::Done);
            }
            let result = self.deprovision_identity(&identity).await;
            return self.finish_teardown(&identity, result).await;
        }

        let status = identity.current_status();
        let step = self.identity_step(&identity, status).await?;
        self.apply_step(&identity, step).await
    }

    fn record_pass(&self, kind: &str, key: &str, result: &Result<PassOutcome, ControllerError>) {
        match result {
            Ok(outcome) => {
                self.backoff.reset(key);
                self.metrics.record_reconciliation(kind, outcome.label());
            }
            Err(e) => self.metrics.record_reconciliation(kind, e.metric_label()),
        }
    }

    async fn apply_step<K: PhasedResource>(&self, resource: &K, step: Step<K::Status>) -> Result<PassOutcome, ControllerError> {
        match step {
            Step::Advance(status) => {
                let resource_version = self.persist_status(resource, status).await?;
                self.ensure_finalizer(resource, resource_version).await?;
                Ok(PassOutcome::Progressed)
            }
            Step::Steady(status) => {
                self.persist_status(resource, status).await?;
                Ok(PassOutcome::Steady)
            }
            Step::NotReady => Ok(PassOutcome::NotReady),
            Step::Idle => Ok(PassOutcome::Done),
        }
    }

    /// Merge-patch `status` with a resourceVersion precondition after
    /// checking the phase change against the transition table. Returns the
    /// resourceVersion after the write.
    async fn persist_status<K: PhasedResource>(&self, resource: &K, mut status: K::Status) -> Result<Option<String>, ControllerError> {
        let current = resource.current_status();
        let from = K::phase(&current);
        let to = K::phase(&status);
        check_transition(from, to)?;

        if from != to {
            K::set_transition_time(&mut status, Utc::now());
        }
        if status == current {
            return Ok(resource.meta().resource_version.clone());
        }

        let (namespace, name) = key_of(resource)?;
        let patch = json!({
            "metadata": { "resourceVersion": resource.meta().resource_version },
            "status": status,
        });
        let updated = self
            .cluster
            .patch_status(&api_resource::<K>(), &namespace, &name, &patch)
            .await?;

        if from != to {
            info!("{} {}/{} moved from phase {} to {}", K::Phase::KIND, namespace, name, from, to);
            self.metrics.record_transition(K::Phase::KIND, &to.to_string());
        }
        Ok(updated.metadata.resource_version)
    }

    async fn ensure_finalizer<K: PhasedResource>(&self, resource: &K, resource_version: Option<String>) -> Result<(), ControllerError> {
        if resource.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let mut finalizers = resource.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(resource, finalizers, resource_version).await
    }

    async fn remove_finalizer<K: PhasedResource>(&self, resource: &K, resource_version: Option<String>) -> Result<(), ControllerError> {
        let finalizers: Vec<String> = resource
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(resource, finalizers, resource_version).await
    }

    async fn patch_finalizers<K: PhasedResource>(
        &self,
        resource: &K,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), ControllerError> {
        let (namespace, name) = key_of(resource)?;
        let patch = json!({
            "metadata": { "resourceVersion": resource_version, "finalizers": finalizers },
        });
        self.cluster
            .patch(&api_resource::<K>(), &namespace, &name, &patch)
            .await?;
        debug!("Updated finalizers of {} {}/{}", K::Phase::KIND, namespace, name);
        Ok(())
    }

    /// Record the teardown result. The finalizer is only released after a
    /// successful teardown.
    async fn finish_teardown<K: PhasedResource>(
        &self,
        resource: &K,
        result: Result<(), ControllerError>,
    ) -> Result<PassOutcome, ControllerError> {
        let (namespace, name) = key_of(resource)?;
        let mut status = resource.current_status();
        match result {
            Ok(()) => {
                K::set_phase(&mut status, K::Phase::DEPROVISIONED);
                let resource_version = self.persist_status(resource, status).await?;
                self.remove_finalizer(resource, resource_version).await?;
                info!("{} {}/{} deprovisioned", K::Phase::KIND, namespace, name);
                Ok(PassOutcome::Done)
            }
            Err(e) => {
                error!("Deprovisioning {} {}/{} failed: {}", K::Phase::KIND, namespace, name, e);
                K::set_phase(&mut status, K::Phase::DEPROVISION_FAILED);
                self.persist_status(resource, status).await?;
                Err(ControllerError::Deprovision(e.to_string()))
            }
        }
    }

    /// Authenticated Keycloak session for this pass
    async fn keycloak_session(&self) -> Result<Arc<dyn KeycloakClientTrait>, ControllerError> {
        let credentials = load_admin_credentials(self.cluster.as_ref(), &self.sso_secret).await?;
        Ok(self.keycloak.authenticate(&credentials).await?)
    }

    fn token(&self, len: usize) -> String {
        let mut tokens = match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens.token(len)
    }
}

fn key_of<K: Resource>(resource: &K) -> Result<(String, String), ControllerError> {
    let meta = resource.meta();
    let namespace = meta
        .namespace
        .clone()
        .ok_or(ControllerError::MissingMetadata("metadata.namespace"))?;
    let name = meta.name.clone().ok_or(ControllerError::MissingMetadata("metadata.name"))?;
    Ok((namespace, name))
}
