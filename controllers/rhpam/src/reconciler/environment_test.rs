//! Unit tests for the RhpamEnvironment lifecycle

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::cluster::get_typed;
    use crate::reconciler::environment::{DIRECT_CLIENT, SERVICE_CLIENT, UI_CLIENT};
    use crate::reconciler::phases::transition_allowed;
    use crate::templates::{BC_SSO_SECRET, BUSINESS_CENTRAL, DATABASE, DATABASE_INIT_CONFIG_MAP, KIE_SERVER, SERVICE_ACCOUNT};
    use crate::test_utils::{FakeCluster, SSO_URL, test_environment, test_reconciler};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
    use keycloak_client::{MockCall, MockKeycloakClient};
    use std::collections::BTreeMap;

    const NS: &str = "team-a";
    const NAME: &str = "demo";

    struct Fixture {
        cluster: Arc<FakeCluster>,
        keycloak: MockKeycloakClient,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let cluster = Arc::new(FakeCluster::default());
        cluster.insert_sso_admin_secret();
        cluster.insert_environment(test_environment(NAME, NS));
        let keycloak = MockKeycloakClient::new();
        let reconciler = test_reconciler(cluster.clone(), &keycloak);
        Fixture {
            cluster,
            keycloak,
            reconciler,
        }
    }

    impl Fixture {
        async fn env(&self) -> Option<RhpamEnvironment> {
            get_typed(self.cluster.as_ref(), NS, NAME).await.unwrap()
        }

        async fn phase(&self) -> EnvironmentPhase {
            self.env().await.unwrap().current_status().phase
        }

        async fn pass(&self) -> Result<PassOutcome, ControllerError> {
            self.reconciler.reconcile_environment(NS, NAME).await
        }

        /// Run passes until the environment reaches `target`
        async fn advance_to(&self, target: EnvironmentPhase) {
            while self.phase().await != target {
                assert_eq!(self.pass().await.unwrap(), PassOutcome::Progressed);
            }
        }

        async fn secret_value(&self, name: &str, key: &str) -> String {
            let secret: Secret = get_typed(self.cluster.as_ref(), NS, name).await.unwrap().unwrap();
            let bytes = secret.data.unwrap().remove(key).unwrap().0;
            String::from_utf8(bytes).unwrap()
        }
    }

    #[tokio::test]
    async fn test_full_provisioning_walk() {
        let f = fixture();
        let mut walk = vec![f.phase().await];

        for _ in 0..5 {
            assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
            walk.push(f.phase().await);
        }
        assert_eq!(walk.last(), Some(&EnvironmentPhase::BusinessCentralInstalled));

        // The database is not up yet
        assert_eq!(f.pass().await.unwrap(), PassOutcome::NotReady);
        assert_eq!(f.phase().await, EnvironmentPhase::BusinessCentralInstalled);

        f.cluster.set_ready_replicas(NS, DATABASE, 1);
        for _ in 0..2 {
            assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
            walk.push(f.phase().await);
        }
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);

        assert_eq!(
            walk,
            [
                EnvironmentPhase::NoPhase,
                EnvironmentPhase::Accepted,
                EnvironmentPhase::RealmProvisioned,
                EnvironmentPhase::Prepared,
                EnvironmentPhase::DatabaseInstalled,
                EnvironmentPhase::BusinessCentralInstalled,
                EnvironmentPhase::DatabaseReady,
                EnvironmentPhase::Complete,
            ]
        );
        assert!(walk.windows(2).all(|pair| transition_allowed(pair[0], pair[1])));

        let env = f.env().await.unwrap();
        let status = env.status.clone().unwrap();
        assert_eq!(status.version.as_deref(), Some(crds::RHPAM_VERSION));
        assert!(status.last_transition_time.is_some());
        assert!(env.finalizers().iter().any(|f| f == FINALIZER));

        for deployment in [DATABASE, BUSINESS_CENTRAL, KIE_SERVER] {
            let d: Deployment = get_typed(f.cluster.as_ref(), NS, deployment).await.unwrap().unwrap();
            let owner = &d.metadata.owner_references.unwrap()[0];
            assert_eq!(owner.uid, env.metadata.uid.clone().unwrap());
        }
        assert!(f.cluster.contains::<ServiceAccount>(NS, SERVICE_ACCOUNT));
        let init: ConfigMap = get_typed(f.cluster.as_ref(), NS, DATABASE_INIT_CONFIG_MAP)
            .await
            .unwrap()
            .unwrap();
        assert!(init.data.unwrap().contains_key("create_rhpam_database.sh"));

        let metrics = f.reconciler.metrics();
        assert_eq!(metrics.transition_count("RhpamEnvironment", "Complete"), 1);
        assert_eq!(metrics.reconciliation_count("RhpamEnvironment", "not_ready"), 1);
    }

    #[tokio::test]
    async fn test_realm_and_clients_are_provisioned() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::RealmProvisioned).await;

        let realm = f.env().await.unwrap().status.unwrap().realm.unwrap();
        let suffix = realm.strip_prefix("demo-").unwrap();
        assert_eq!(suffix.len(), crate::token::REALM_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(f.keycloak.has_realm(&realm));

        let clients = f.keycloak.clients(&realm);
        let client = |id: &str| clients.iter().find(|c| c.client_id == id).unwrap();
        let ui = client(UI_CLIENT);
        assert!(ui.standard_flow_enabled && ui.direct_access_grants_enabled && !ui.public_client);
        assert_eq!(ui.root_url.as_deref(), Some("https://rhpam-bc-team-a.apps.example.com"));
        let service = client(SERVICE_CLIENT);
        assert!(service.bearer_only && service.direct_access_grants_enabled);
        let direct = client(DIRECT_CLIENT);
        assert!(direct.public_client && direct.direct_access_grants_enabled);

        assert_eq!(f.secret_value(BC_SSO_SECRET, "realm").await, realm);
        assert_eq!(f.secret_value(BC_SSO_SECRET, "client").await, UI_CLIENT);
        assert_eq!(f.secret_value(BC_SSO_SECRET, "sso-url").await, format!("{SSO_URL}/auth"));
        assert!(!f.secret_value(BC_SSO_SECRET, "client-secret").await.is_empty());
        assert_eq!(f.secret_value(crate::templates::KS_SSO_SECRET, "client").await, SERVICE_CLIENT);

        let logins = f.keycloak.logins();
        assert!(logins.iter().all(|l| l.username == "admin" && l.base_url == SSO_URL));
    }

    #[tokio::test]
    async fn test_realm_recorded_in_secret_is_reused() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::Accepted).await;
        // an earlier pass wrote the secret but lost its status update
        let env = f.env().await.unwrap();
        f.reconciler
            .applier
            .ensure_secret(&env, BC_SSO_SECRET, BTreeMap::from([("realm".to_string(), "demo-keep01".to_string())]))
            .await
            .unwrap();
        f.keycloak.add_realm("demo-keep01");
        f.advance_to(EnvironmentPhase::RealmProvisioned).await;

        let status = f.env().await.unwrap().status.unwrap();
        assert_eq!(status.realm.as_deref(), Some("demo-keep01"));
        assert_eq!(f.keycloak.realm_names(), ["demo-keep01"]);
        assert_eq!(f.keycloak.clients("demo-keep01").len(), 3);
    }

    #[tokio::test]
    async fn test_unowned_realm_secret_is_not_adopted() {
        let f = fixture();
        f.cluster.insert_secret(NS, BC_SSO_SECRET, &[("realm", "demo-keep01")]);
        f.advance_to(EnvironmentPhase::RealmProvisioned).await;

        let realm = f.env().await.unwrap().status.unwrap().realm.unwrap();
        assert_ne!(realm, "demo-keep01");
        assert!(realm.starts_with("demo-"));
        assert!(f.keycloak.has_realm(&realm));
    }

    #[tokio::test]
    async fn test_environments_sharing_a_namespace_get_their_own_realms() {
        let f = fixture();
        f.cluster.insert_environment(test_environment("first", NS));
        f.cluster.insert_environment(test_environment("second", NS));

        let mut realms = Vec::new();
        for name in ["first", "second"] {
            for _ in 0..2 {
                assert_eq!(
                    f.reconciler.reconcile_environment(NS, name).await.unwrap(),
                    PassOutcome::Progressed
                );
            }
            let env: RhpamEnvironment = get_typed(f.cluster.as_ref(), NS, name).await.unwrap().unwrap();
            let status = env.status.unwrap();
            assert_eq!(status.phase, EnvironmentPhase::RealmProvisioned);
            realms.push(status.realm.unwrap());
        }

        assert!(realms[0].starts_with("first-"));
        assert!(realms[1].starts_with("second-"), "second environment got realm {}", realms[1]);
        assert!(f.keycloak.has_realm(&realms[0]) && f.keycloak.has_realm(&realms[1]));

        // removing the second environment must leave the first realm alone
        f.cluster.mark_deleted::<RhpamEnvironment>(NS, "second");
        assert_eq!(
            f.reconciler.reconcile_environment(NS, "second").await.unwrap(),
            PassOutcome::Done
        );
        assert!(!f.keycloak.has_realm(&realms[1]));
        assert!(f.keycloak.has_realm(&realms[0]));
    }

    #[tokio::test]
    async fn test_database_credentials_are_generated() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::DatabaseInstalled).await;

        let user = f.secret_value(DATABASE, "database-user").await;
        assert_eq!(user.len(), 4 + crate::token::DB_USER_SUFFIX_LEN);
        assert!(user.starts_with("user"));
        assert_eq!(f.secret_value(DATABASE, "database-password").await.len(), 10);
        assert_eq!(f.secret_value(DATABASE, "database-name").await, "rhpam");
    }

    #[tokio::test]
    async fn test_database_credentials_survive_a_repeated_install() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::Prepared).await;

        // run the install without persisting its phase, as if the status
        // write had failed, then let a normal pass repeat it
        let env = f.env().await.unwrap();
        let step = f.reconciler.environment_step(&env, env.current_status()).await.unwrap();
        assert!(matches!(step, Step::Advance(ref s) if s.phase == EnvironmentPhase::DatabaseInstalled));
        assert_eq!(f.phase().await, EnvironmentPhase::Prepared);
        let user = f.secret_value(DATABASE, "database-user").await;
        let password = f.secret_value(DATABASE, "database-password").await;
        let creates = f.cluster.create_count();

        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
        assert_eq!(f.phase().await, EnvironmentPhase::DatabaseInstalled);
        assert_eq!(f.secret_value(DATABASE, "database-user").await, user);
        assert_eq!(f.secret_value(DATABASE, "database-password").await, password);
        assert_eq!(f.cluster.create_count(), creates);
    }

    #[tokio::test]
    async fn test_database_needs_exactly_one_ready_replica() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::BusinessCentralInstalled).await;

        f.cluster.set_ready_replicas(NS, DATABASE, 2);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::NotReady);
        assert_eq!(f.phase().await, EnvironmentPhase::BusinessCentralInstalled);

        f.cluster.set_ready_replicas(NS, DATABASE, 1);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
        assert_eq!(f.phase().await, EnvironmentPhase::DatabaseReady);
    }

    #[tokio::test]
    async fn test_missing_admin_secret_keeps_phase() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.insert_environment(test_environment(NAME, NS));
        let keycloak = MockKeycloakClient::new();
        let reconciler = test_reconciler(cluster.clone(), &keycloak);

        let err = reconciler.reconcile_environment(NS, NAME).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));

        let env: RhpamEnvironment = get_typed(cluster.as_ref(), NS, NAME).await.unwrap().unwrap();
        assert_eq!(env.status, None);
        assert!(env.finalizers().is_empty());
        assert_eq!(reconciler.metrics().reconciliation_count("RhpamEnvironment", "config_error"), 1);
    }

    #[tokio::test]
    async fn test_invalid_domain_is_rejected() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.insert_sso_admin_secret();
        let mut env = test_environment(NAME, NS);
        env.spec.domain = "Not A Domain".to_string();
        cluster.insert_environment(env);
        let reconciler = test_reconciler(cluster.clone(), &MockKeycloakClient::new());

        let err = reconciler.reconcile_environment(NS, NAME).await.unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_keycloak_failure_is_retried_in_place() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::Accepted).await;
        f.keycloak.fail_operation("create_client");

        let err = f.pass().await.unwrap_err();
        assert!(matches!(err, ControllerError::Keycloak(_)));
        assert_eq!(f.phase().await, EnvironmentPhase::Accepted);

        f.keycloak.clear_failures();
        f.advance_to(EnvironmentPhase::RealmProvisioned).await;
        assert_eq!(f.keycloak.realm_names().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_deletes_realm_and_releases_finalizer() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::Prepared).await;
        let realm = f.env().await.unwrap().status.unwrap().realm.unwrap();

        f.cluster.mark_deleted::<RhpamEnvironment>(NS, NAME);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);

        assert!(!f.keycloak.has_realm(&realm));
        assert!(f.keycloak.calls().contains(&MockCall::DeleteRealm(realm)));
        assert!(f.env().await.is_none());
        assert_eq!(f.reconciler.metrics().transition_count("RhpamEnvironment", "Deprovisioned"), 1);
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_finalizer() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::RealmProvisioned).await;
        f.keycloak.fail_operation("delete_realm");
        f.cluster.mark_deleted::<RhpamEnvironment>(NS, NAME);

        let err = f.pass().await.unwrap_err();
        assert!(matches!(err, ControllerError::Deprovision(_)));
        let env = f.env().await.unwrap();
        assert_eq!(env.current_status().phase, EnvironmentPhase::DeprovisionFailed);
        assert!(env.finalizers().iter().any(|f| f == FINALIZER));

        f.keycloak.clear_failures();
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);
        assert!(f.env().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_realm() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::RealmProvisioned).await;
        let realm = f.env().await.unwrap().status.unwrap().realm.unwrap();
        f.keycloak.delete_realm(&realm).await.unwrap();

        f.cluster.mark_deleted::<RhpamEnvironment>(NS, NAME);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);
        assert!(f.env().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_environment_is_done() {
        let cluster = Arc::new(FakeCluster::default());
        let reconciler = test_reconciler(cluster, &MockKeycloakClient::new());
        assert_eq!(
            reconciler.reconcile_environment(NS, "ghost").await.unwrap(),
            PassOutcome::Done
        );
    }

    #[tokio::test]
    async fn test_stored_illegal_phase_is_never_written() {
        let f = fixture();
        f.advance_to(EnvironmentPhase::Accepted).await;
        let env = f.env().await.unwrap();
        let mut status = env.current_status();
        status.phase = EnvironmentPhase::Complete;

        let err = f.reconciler.persist_status(&env, status).await.unwrap_err();
        assert!(matches!(err, ControllerError::IllegalTransition { .. }));
        assert_eq!(f.phase().await, EnvironmentPhase::Accepted);
    }
}
