//! RhpamEnvironment phase handlers.
//!
//! Each handler is safe to repeat: objects are created only when absent and
//! conflicting realm/client creates are treated as success, so a pass that
//! failed after some side effects can simply run again.

use super::phases::PhaseTable;
use super::{Reconciler, Step};
use crate::cluster::get_typed;
use crate::credentials::load_admin_credentials;
use crate::error::ControllerError;
use crate::templates::{
    BC_SSO_SECRET, BUSINESS_CENTRAL, DATABASE, DATABASE_INIT_CONFIG_MAP, DATABASE_NAME, KIE_SERVER, KS_SSO_SECRET,
    RhpamParameters, Template,
};
use crate::token::{DB_PASSWORD_LEN, DB_USER_SUFFIX_LEN, REALM_SUFFIX_LEN};
use crds::{EnvironmentPhase, RHPAM_VERSION, RhpamEnvironment, RhpamEnvironmentStatus};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use keycloak_client::{ClientRepresentation, KeycloakError, RealmRepresentation};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Confidential browser client used by Business Central
pub const UI_CLIENT: &str = "rhpambc";
/// Confidential bearer-only client of the KIE server
pub const SERVICE_CLIENT: &str = "rhpamks";
/// Public client of the KIE server
pub const DIRECT_CLIENT: &str = "rhpamks-direct";

impl Reconciler {
    pub(super) async fn environment_step(
        &self,
        env: &RhpamEnvironment,
        status: RhpamEnvironmentStatus,
    ) -> Result<Step<RhpamEnvironmentStatus>, ControllerError> {
        let mut next = status.clone();
        next.version = Some(RHPAM_VERSION.to_string());

        match status.phase {
            EnvironmentPhase::NoPhase => self.initialize_environment(env).await?,
            EnvironmentPhase::Accepted => next.realm = Some(self.provision_realm(env).await?),
            EnvironmentPhase::RealmProvisioned | EnvironmentPhase::Prepare => self.prepare(env).await?,
            EnvironmentPhase::Prepared => self.install_database(env).await?,
            EnvironmentPhase::DatabaseInstalled => self.install_business_central(env).await?,
            EnvironmentPhase::BusinessCentralInstalled => {
                if !self.wait_for_database(env).await? {
                    return Ok(Step::NotReady);
                }
            }
            EnvironmentPhase::DatabaseReady => self.install_kie_server(env).await?,
            EnvironmentPhase::Complete | EnvironmentPhase::Deprovisioned | EnvironmentPhase::DeprovisionFailed => {
                return Ok(Step::Idle);
            }
        }

        next.phase = status.phase.next().ok_or_else(|| ControllerError::IllegalTransition {
            kind: EnvironmentPhase::KIND,
            from: status.phase.to_string(),
            to: "<none>".to_string(),
        })?;
        Ok(Step::Advance(next))
    }

    /// Validate the defaulted spec and make sure the SSO admin secret is usable
    async fn initialize_environment(&self, env: &RhpamEnvironment) -> Result<(), ControllerError> {
        env.spec.with_defaults().validate()?;
        load_admin_credentials(self.cluster.as_ref(), &self.sso_secret).await?;
        Ok(())
    }

    /// Create the realm and its three clients, then store the client secrets
    /// for Business Central and the KIE server. Returns the realm id.
    async fn provision_realm(&self, env: &RhpamEnvironment) -> Result<String, ControllerError> {
        let params = RhpamParameters::for_environment(env)?;
        let credentials = load_admin_credentials(self.cluster.as_ref(), &self.sso_secret).await?;
        let keycloak = self.keycloak.authenticate(&credentials).await?;

        let realm = match self.recorded_realm(env).await? {
            Some(realm) => {
                debug!("Reusing realm {} recorded in {}", realm, BC_SSO_SECRET);
                realm
            }
            None => format!("{}-{}", params.environment, self.token(REALM_SUFFIX_LEN)),
        };

        let representation = RealmRepresentation {
            realm: realm.clone(),
            enabled: true,
            display_name: Some(format!("RHPAM {}/{}", params.namespace, params.environment)),
            ..Default::default()
        };
        tolerate_conflict(keycloak.create_realm(&representation).await, "realm", &realm)?;
        info!("Realm {} ready for {}/{}", realm, params.namespace, params.environment);

        for client in realm_clients(&params) {
            tolerate_conflict(keycloak.create_client(&realm, &client).await, "client", &client.client_id)?;
        }

        let sso_url = format!("{}/auth", credentials.base_url);
        let bc_secret = keycloak.client_secret_for(&realm, UI_CLIENT).await?;
        let ks_secret = keycloak.client_secret_for(&realm, SERVICE_CLIENT).await?;
        self.applier
            .ensure_secret(env, BC_SSO_SECRET, sso_secret_data(&sso_url, &realm, UI_CLIENT, &bc_secret))
            .await?;
        self.applier
            .ensure_secret(env, KS_SSO_SECRET, sso_secret_data(&sso_url, &realm, SERVICE_CLIENT, &ks_secret))
            .await?;

        Ok(realm)
    }

    /// Realm id stored by an earlier, interrupted ProvisionRealm of this
    /// environment. A secret owned by another environment in the namespace
    /// is ignored.
    async fn recorded_realm(&self, env: &RhpamEnvironment) -> Result<Option<String>, ControllerError> {
        let namespace = env
            .metadata
            .namespace
            .as_deref()
            .ok_or(ControllerError::MissingMetadata("metadata.namespace"))?;
        let Some(secret) = get_typed::<Secret>(self.cluster.as_ref(), namespace, BC_SSO_SECRET).await? else {
            return Ok(None);
        };

        let owned = env.metadata.uid.as_deref().is_some_and(|uid| {
            secret
                .metadata
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.uid == uid)
        });
        if !owned {
            debug!("{}/{} belongs to another environment", namespace, BC_SSO_SECRET);
            return Ok(None);
        }

        let prefix = format!("{}-", env.name_any());
        Ok(secret
            .data
            .and_then(|mut data| data.remove("realm"))
            .and_then(|realm| String::from_utf8(realm.0).ok())
            .filter(|realm| realm.len() > prefix.len() && realm.starts_with(&prefix)))
    }

    async fn prepare(&self, env: &RhpamEnvironment) -> Result<(), ControllerError> {
        let params = RhpamParameters::for_environment(env)?;
        self.applier.apply(env, Template::ServiceAccount, &params).await?;
        Ok(())
    }

    async fn install_database(&self, env: &RhpamEnvironment) -> Result<(), ControllerError> {
        let params = RhpamParameters::for_environment(env)?;

        let credentials = BTreeMap::from([
            ("database-user".to_string(), format!("user{}", self.token(DB_USER_SUFFIX_LEN))),
            ("database-password".to_string(), self.token(DB_PASSWORD_LEN)),
            ("database-name".to_string(), DATABASE_NAME.to_string()),
        ]);
        self.applier.ensure_secret(env, DATABASE, credentials).await?;

        let init_data = self.templates.init_data(&params)?;
        self.applier
            .ensure_config_map(env, DATABASE_INIT_CONFIG_MAP, init_data)
            .await?;

        for template in [Template::DatabasePvc, Template::DatabaseService, Template::DatabaseDeployment] {
            self.applier.apply(env, template, &params).await?;
        }
        Ok(())
    }

    async fn install_business_central(&self, env: &RhpamEnvironment) -> Result<(), ControllerError> {
        let params = RhpamParameters::for_environment(env)?;
        for template in [
            Template::BusinessCentralPvc,
            Template::BusinessCentralService,
            Template::BusinessCentralRoute,
            Template::BusinessCentralDeployment,
        ] {
            self.applier.apply(env, template, &params).await?;
        }
        Ok(())
    }

    /// Whether the database deployment reports exactly one ready replica
    pub(super) async fn wait_for_database(&self, env: &RhpamEnvironment) -> Result<bool, ControllerError> {
        let namespace = env
            .metadata
            .namespace
            .as_deref()
            .ok_or(ControllerError::MissingMetadata("metadata.namespace"))?;
        let deployment: Option<Deployment> = get_typed(self.cluster.as_ref(), namespace, DATABASE).await?;
        let ready = deployment
            .and_then(|d| d.status)
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready != 1 {
            debug!("Database {}/{} has {} ready replicas", namespace, DATABASE, ready);
        }
        Ok(ready == 1)
    }

    async fn install_kie_server(&self, env: &RhpamEnvironment) -> Result<(), ControllerError> {
        let params = RhpamParameters::for_environment(env)?;
        for template in [Template::KieServerService, Template::KieServerRoute, Template::KieServerDeployment] {
            self.applier.apply(env, template, &params).await?;
        }
        Ok(())
    }

    /// Delete the environment's realm. Cluster objects go away with their
    /// owner reference.
    pub(super) async fn deprovision_environment(&self, env: &RhpamEnvironment) -> Result<(), ControllerError> {
        let Some(realm) = env.status.as_ref().and_then(|s| s.realm.clone()) else {
            debug!("No realm recorded, nothing to deprovision");
            return Ok(());
        };
        let keycloak = self.keycloak_session().await?;
        match keycloak.delete_realm(&realm).await {
            Ok(()) => info!("Deleted realm {}", realm),
            Err(e) if e.is_not_found() => debug!("Realm {} already gone", realm),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

fn tolerate_conflict(result: Result<(), KeycloakError>, what: &str, name: &str) -> Result<(), KeycloakError> {
    match result {
        Err(e) if e.is_conflict() => {
            warn!("{} {} already exists", what, name);
            Ok(())
        }
        other => other,
    }
}

/// The UI, service and direct-access clients of an environment's realm
pub fn realm_clients(params: &RhpamParameters) -> [ClientRepresentation; 3] {
    let bc_url = params.route_url(BUSINESS_CENTRAL);
    let ks_url = params.route_url(KIE_SERVER);
    let with_urls = |client_id: &str, url: &str| ClientRepresentation {
        client_id: client_id.to_string(),
        enabled: true,
        root_url: Some(url.to_string()),
        admin_url: Some(url.to_string()),
        base_url: Some(format!("{url}/")),
        redirect_uris: vec![format!("{url}/*")],
        web_origins: vec![url.to_string()],
        protocol: Some("openid-connect".to_string()),
        direct_access_grants_enabled: true,
        ..Default::default()
    };

    [
        ClientRepresentation {
            standard_flow_enabled: true,
            ..with_urls(UI_CLIENT, &bc_url)
        },
        ClientRepresentation {
            bearer_only: true,
            ..with_urls(SERVICE_CLIENT, &ks_url)
        },
        ClientRepresentation {
            public_client: true,
            ..with_urls(DIRECT_CLIENT, &ks_url)
        },
    ]
}

fn sso_secret_data(sso_url: &str, realm: &str, client: &str, secret: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("sso-url".to_string(), sso_url.to_string()),
        ("realm".to_string(), realm.to_string()),
        ("client".to_string(), client.to_string()),
        ("client-secret".to_string(), secret.to_string()),
    ])
}
