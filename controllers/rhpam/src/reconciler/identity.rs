//! RhpamIdentity phase handlers.

use super::convergence::ConvergenceEngine;
use super::{Reconciler, Step};
use crate::cluster::list_typed;
use crate::credentials::load_admin_credentials;
use crate::error::ControllerError;
use crds::{IdentityPhase, RhpamEnvironment, RhpamIdentity, RhpamIdentityStatus};
use kube::ResourceExt;
use tracing::{debug, info};

impl Reconciler {
    pub(super) async fn identity_step(
        &self,
        identity: &RhpamIdentity,
        status: RhpamIdentityStatus,
    ) -> Result<Step<RhpamIdentityStatus>, ControllerError> {
        let namespace = identity.namespace().ok_or(ControllerError::MissingMetadata("metadata.namespace"))?;

        match status.phase {
            IdentityPhase::NoPhase => {
                load_admin_credentials(self.cluster.as_ref(), &self.sso_secret).await?;
                Ok(Step::Advance(RhpamIdentityStatus {
                    phase: IdentityPhase::Accepted,
                    ..status
                }))
            }
            IdentityPhase::Accepted => {
                let Some(realm) = self.environment_realm(&namespace).await? else {
                    debug!("No provisioned RhpamEnvironment in {} yet", namespace);
                    return Ok(Step::NotReady);
                };
                let keycloak = self.keycloak_session().await?;
                let engine = ConvergenceEngine::new(keycloak.as_ref(), &self.principals, &realm);
                let defaults = engine.ensure_defaults().await?;
                let report = engine.converge(&identity.spec).await?;
                info!("Realm {} seeded ({}) and converged ({})", realm, defaults, report);
                Ok(Step::Advance(RhpamIdentityStatus {
                    phase: IdentityPhase::Reconcile,
                    realm: Some(realm),
                    ..status
                }))
            }
            IdentityPhase::Reconcile => {
                let realm = match status.realm.clone() {
                    Some(realm) => realm,
                    None => match self.environment_realm(&namespace).await? {
                        Some(realm) => realm,
                        None => return Ok(Step::NotReady),
                    },
                };
                let keycloak = self.keycloak_session().await?;
                let report = ConvergenceEngine::new(keycloak.as_ref(), &self.principals, &realm)
                    .converge(&identity.spec)
                    .await?;
                if report.is_noop() {
                    debug!("Realm {} already converged", realm);
                } else {
                    info!("Converged realm {}: {}", realm, report);
                }
                Ok(Step::Steady(RhpamIdentityStatus {
                    realm: Some(realm),
                    ..status
                }))
            }
            IdentityPhase::Deprovisioned | IdentityPhase::DeprovisionFailed => Ok(Step::Idle),
        }
    }

    /// Realm of the first provisioned, live environment in `namespace`,
    /// ordered by name
    async fn environment_realm(&self, namespace: &str) -> Result<Option<String>, ControllerError> {
        let mut environments: Vec<RhpamEnvironment> = list_typed(self.cluster.as_ref(), namespace).await?;
        environments.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
        Ok(environments
            .into_iter()
            .filter(|env| env.metadata.deletion_timestamp.is_none())
            .find_map(|env| env.status.and_then(|s| s.realm).filter(|realm| !realm.is_empty())))
    }

    /// Delete the declared non-default users and roles from the realm
    pub(super) async fn deprovision_identity(&self, identity: &RhpamIdentity) -> Result<(), ControllerError> {
        let Some(realm) = identity.status.as_ref().and_then(|s| s.realm.clone()) else {
            debug!("Identity {} never reached a realm", identity.name_any());
            return Ok(());
        };
        let keycloak = self.keycloak_session().await?;
        match ConvergenceEngine::new(keycloak.as_ref(), &self.principals, &realm)
            .remove_declared(&identity.spec)
            .await
        {
            Ok(report) => {
                info!("Removed declared principals from realm {}: {}", realm, report);
                Ok(())
            }
            // The environment teardown may already have dropped the realm
            Err(e) if e.is_not_found() => {
                debug!("Realm {} is gone: {}", realm, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
