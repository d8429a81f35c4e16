//! Unit tests for the RhpamIdentity lifecycle

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::cluster::{api_resource, get_typed};
    use crate::reconciler::principals::DEFAULT_ROLES;
    use crate::test_utils::{FakeCluster, identity_spec, spec_user, test_environment, test_identity, test_reconciler};
    use keycloak_client::{MockCall, MockKeycloakClient};
    use std::collections::BTreeSet;

    const NS: &str = "team-a";
    const NAME: &str = "people";
    const REALM: &str = "demo-ab12cd";

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn provisioned_environment(name: &str, realm: &str) -> RhpamEnvironment {
        let mut env = test_environment(name, NS);
        env.status = Some(RhpamEnvironmentStatus {
            phase: EnvironmentPhase::Complete,
            realm: Some(realm.to_string()),
            ..Default::default()
        });
        env
    }

    struct Fixture {
        cluster: Arc<FakeCluster>,
        keycloak: MockKeycloakClient,
        reconciler: Reconciler,
    }

    fn fixture(with_environment: bool) -> Fixture {
        let cluster = Arc::new(FakeCluster::default());
        cluster.insert_sso_admin_secret();
        let keycloak = MockKeycloakClient::new();
        keycloak.add_realm(REALM);
        if with_environment {
            cluster.insert_environment(provisioned_environment("demo", REALM));
        }
        cluster.insert_identity(test_identity(
            NAME,
            NS,
            identity_spec(&["viewer"], vec![spec_user("alice", &["viewer", "analyst"])]),
        ));
        let reconciler = test_reconciler(cluster.clone(), &keycloak);
        Fixture {
            cluster,
            keycloak,
            reconciler,
        }
    }

    impl Fixture {
        async fn identity(&self) -> Option<RhpamIdentity> {
            get_typed(self.cluster.as_ref(), NS, NAME).await.unwrap()
        }

        async fn phase(&self) -> IdentityPhase {
            self.identity().await.unwrap().current_status().phase
        }

        async fn pass(&self) -> Result<PassOutcome, ControllerError> {
            self.reconciler.reconcile_identity(NS, NAME).await
        }

        async fn reach_reconcile(&self) {
            assert_eq!(self.pass().await.unwrap(), PassOutcome::Progressed);
            assert_eq!(self.pass().await.unwrap(), PassOutcome::Progressed);
            assert_eq!(self.phase().await, IdentityPhase::Reconcile);
        }
    }

    #[tokio::test]
    async fn test_accepted_seeds_defaults_and_converges() {
        let f = fixture(true);

        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
        assert_eq!(f.phase().await, IdentityPhase::Accepted);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);

        let identity = f.identity().await.unwrap();
        let status = identity.current_status();
        assert_eq!(status.phase, IdentityPhase::Reconcile);
        assert_eq!(status.realm.as_deref(), Some(REALM));
        assert!(identity.finalizers().iter().any(|f| f == FINALIZER));

        let roles = f.keycloak.role_names(REALM);
        assert!(DEFAULT_ROLES.iter().all(|r| roles.contains(*r)));
        assert!(roles.contains("viewer"));
        assert_eq!(
            f.keycloak.usernames(REALM),
            set(&["adminuser", "alice", "controlleruser", "executionuser", "mavenuser"])
        );
        assert_eq!(f.keycloak.user_roles(REALM, "alice"), set(&["analyst", "viewer"]));
        assert_eq!(f.keycloak.user_roles(REALM, "adminuser"), set(&["admin", "kie-server"]));
    }

    #[tokio::test]
    async fn test_steady_state_issues_no_writes() {
        let f = fixture(true);
        f.reach_reconcile().await;
        f.keycloak.clear_calls();

        assert_eq!(f.pass().await.unwrap(), PassOutcome::Steady);
        assert!(f.keycloak.calls().is_empty(), "{:?}", f.keycloak.calls());
        assert_eq!(f.phase().await, IdentityPhase::Reconcile);
        assert_eq!(f.reconciler.metrics().reconciliation_count("RhpamIdentity", "steady"), 1);
    }

    #[tokio::test]
    async fn test_spec_changes_are_converged() {
        let f = fixture(true);
        f.reach_reconcile().await;

        let spec = identity_spec(&["auditor"], vec![spec_user("bob", &["auditor"])]);
        f.cluster
            .patch(
                &api_resource::<RhpamIdentity>(),
                NS,
                NAME,
                &serde_json::json!({ "spec": spec }),
            )
            .await
            .unwrap();
        f.keycloak.clear_calls();

        assert_eq!(f.pass().await.unwrap(), PassOutcome::Steady);

        let roles = f.keycloak.role_names(REALM);
        assert!(roles.contains("auditor"));
        assert!(!roles.contains("viewer"));
        let users = f.keycloak.usernames(REALM);
        assert!(users.contains("bob"));
        assert!(!users.contains("alice"));
        assert!(users.contains("adminuser"));
        assert_eq!(f.keycloak.user_roles(REALM, "bob"), set(&["auditor"]));
    }

    #[tokio::test]
    async fn test_waits_for_a_provisioned_environment() {
        let f = fixture(false);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::NotReady);
        assert_eq!(f.phase().await, IdentityPhase::Accepted);
        assert!(f.keycloak.calls().is_empty());

        // An environment still in early provisioning has no realm yet
        f.cluster.insert_environment(test_environment("demo", NS));
        assert_eq!(f.pass().await.unwrap(), PassOutcome::NotReady);

        f.cluster.insert_environment(provisioned_environment("demo", REALM));
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
        assert_eq!(f.phase().await, IdentityPhase::Reconcile);
    }

    #[tokio::test]
    async fn test_environment_realm_lookup_is_ordered_and_skips_deleted() {
        let f = fixture(false);
        f.keycloak.add_realm("first-000001");
        f.keycloak.add_realm("second-00002");

        let mut deleting = provisioned_environment("a-env", "first-000001");
        deleting.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        f.cluster.insert_environment(deleting);
        f.cluster.mark_deleted::<RhpamEnvironment>(NS, "a-env");
        f.cluster.insert_environment(provisioned_environment("c-env", "third-000003"));
        f.cluster.insert_environment(provisioned_environment("b-env", "second-00002"));

        f.reach_reconcile().await;
        let status = f.identity().await.unwrap().current_status();
        assert_eq!(status.realm.as_deref(), Some("second-00002"));
    }

    #[tokio::test]
    async fn test_deletion_removes_declared_principals() {
        let f = fixture(true);
        f.reach_reconcile().await;
        f.cluster.mark_deleted::<RhpamIdentity>(NS, NAME);

        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);

        assert!(f.identity().await.is_none());
        assert!(!f.keycloak.usernames(REALM).contains("alice"));
        assert!(!f.keycloak.role_names(REALM).contains("viewer"));
        assert!(f.keycloak.usernames(REALM).contains("adminuser"));
        assert!(f.keycloak.role_names(REALM).contains("admin"));
        assert_eq!(f.reconciler.metrics().transition_count("RhpamIdentity", "Deprovisioned"), 1);
    }

    #[tokio::test]
    async fn test_failed_deletion_keeps_finalizer() {
        let f = fixture(true);
        f.reach_reconcile().await;
        f.keycloak.fail_operation("delete_user");
        f.cluster.mark_deleted::<RhpamIdentity>(NS, NAME);

        let err = f.pass().await.unwrap_err();
        assert!(matches!(err, ControllerError::Deprovision(_)));
        let identity = f.identity().await.unwrap();
        assert_eq!(identity.current_status().phase, IdentityPhase::DeprovisionFailed);
        assert!(identity.finalizers().iter().any(|f| f == FINALIZER));

        f.keycloak.clear_failures();
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);
        assert!(f.identity().await.is_none());
        assert!(f.keycloak.calls().iter().any(|c| matches!(c, MockCall::DeleteUser { username, .. } if username == "alice")));
    }

    #[tokio::test]
    async fn test_deletion_after_realm_is_gone() {
        let f = fixture(true);
        f.reach_reconcile().await;
        f.keycloak.delete_realm(REALM).await.unwrap();
        f.cluster.mark_deleted::<RhpamIdentity>(NS, NAME);

        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);
        assert!(f.identity().await.is_none());
    }

    #[tokio::test]
    async fn test_deletion_before_any_realm_skips_keycloak() {
        let f = fixture(false);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
        f.cluster.mark_deleted::<RhpamIdentity>(NS, NAME);

        assert_eq!(f.pass().await.unwrap(), PassOutcome::Done);
        assert!(f.identity().await.is_none());
        assert!(f.keycloak.logins().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_admin_login_surfaces_error() {
        let f = fixture(true);
        assert_eq!(f.pass().await.unwrap(), PassOutcome::Progressed);
        f.keycloak.reject_logins();

        let err = f.pass().await.unwrap_err();
        assert!(matches!(err, ControllerError::Keycloak(_)));
        assert_eq!(f.phase().await, IdentityPhase::Accepted);
        assert_eq!(f.reconciler.metrics().reconciliation_count("RhpamIdentity", "keycloak_error"), 1);
    }
}
