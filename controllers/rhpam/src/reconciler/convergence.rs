//! Identity convergence.
//!
//! Makes a realm's roles, users and realm-role mappings match an
//! [`RhpamIdentitySpec`] with a pair diff: every name is marked as observed
//! (present in Keycloak) and/or desired (present in the spec), and only the
//! one-sided entries cause a call. Roles are converged before users because
//! mappings need the role to exist.
//!
//! Remote state is read fresh on every pass. The first failing call aborts the
//! pass; re-running it from scratch is always safe.

use super::principals::{DefaultPrincipals, is_system_role};
use crds::{RhpamIdentitySpec, UserSpec};
use keycloak_client::{KeycloakClientTrait, KeycloakError, RoleRepresentation, UserRepresentation};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Which sides of the diff a name was seen on
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Presence {
    observed: bool,
    desired: bool,
}

fn pair_diff(
    observed: impl IntoIterator<Item = String>,
    desired: impl IntoIterator<Item = String>,
) -> BTreeMap<String, Presence> {
    let mut pairs: BTreeMap<String, Presence> = BTreeMap::new();
    for name in observed {
        pairs.entry(name).or_default().observed = true;
    }
    for name in desired {
        pairs.entry(name).or_default().desired = true;
    }
    pairs
}

/// Calls issued by one pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub roles_created: usize,
    pub roles_deleted: usize,
    pub users_created: usize,
    pub users_deleted: usize,
    pub mappings_added: usize,
    pub mappings_removed: usize,
}

impl ConvergenceReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for ConvergenceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "roles +{}/-{}, users +{}/-{}, mappings +{}/-{}",
            self.roles_created,
            self.roles_deleted,
            self.users_created,
            self.users_deleted,
            self.mappings_added,
            self.mappings_removed
        )
    }
}

pub struct ConvergenceEngine<'a> {
    keycloak: &'a dyn KeycloakClientTrait,
    defaults: &'a DefaultPrincipals,
    realm: &'a str,
}

impl<'a> ConvergenceEngine<'a> {
    pub fn new(keycloak: &'a dyn KeycloakClientTrait, defaults: &'a DefaultPrincipals, realm: &'a str) -> Self {
        Self {
            keycloak,
            defaults,
            realm,
        }
    }

    /// Create the default roles and users, and give each default user its
    /// default roles. Nothing is removed.
    pub async fn ensure_defaults(&self) -> Result<ConvergenceReport, KeycloakError> {
        let mut report = ConvergenceReport::default();

        for role in self.defaults.roles() {
            if self.keycloak.get_role(self.realm, role).await?.is_none() {
                self.keycloak.create_role(self.realm, &RoleRepresentation::named(role)).await?;
                info!("Created default role {} in realm {}", role, self.realm);
                report.roles_created += 1;
            }
        }

        let roles = self.realm_roles().await?;
        for user in self.defaults.users() {
            let user_id = match self.keycloak.find_user_by_username(self.realm, &user.username).await? {
                Some(existing) => user_id(&existing)?,
                None => {
                    report.users_created += 1;
                    self.create_user(user).await?
                }
            };
            self.sync_mappings(&user.username, &user_id, &user.roles, &roles, false, &mut report)
                .await?;
        }

        Ok(report)
    }

    /// One convergence pass of the realm against `spec`
    pub async fn converge(&self, spec: &RhpamIdentitySpec) -> Result<ConvergenceReport, KeycloakError> {
        let mut report = ConvergenceReport::default();
        self.converge_roles(spec, &mut report).await?;
        self.converge_users(spec, &mut report).await?;
        Ok(report)
    }

    async fn converge_roles(&self, spec: &RhpamIdentitySpec, report: &mut ConvergenceReport) -> Result<(), KeycloakError> {
        let observed = self.realm_roles().await?.into_keys();
        let desired = spec.roles.iter().map(|r| r.name.clone());

        for (name, presence) in pair_diff(observed, desired) {
            match (presence.observed, presence.desired) {
                (true, false) if self.defaults.is_protected_role(&name) => {
                    debug!("Keeping protected role {} in realm {}", name, self.realm);
                }
                (true, false) => {
                    self.keycloak.delete_role(self.realm, &name).await?;
                    info!("Deleted role {} from realm {}", name, self.realm);
                    report.roles_deleted += 1;
                }
                (false, true) => {
                    self.keycloak.create_role(self.realm, &RoleRepresentation::named(&name)).await?;
                    info!("Created role {} in realm {}", name, self.realm);
                    report.roles_created += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn converge_users(&self, spec: &RhpamIdentitySpec, report: &mut ConvergenceReport) -> Result<(), KeycloakError> {
        let roles = self.realm_roles().await?;
        let observed: BTreeMap<String, UserRepresentation> = self
            .keycloak
            .list_users(self.realm)
            .await?
            .into_iter()
            .map(|u| (u.username.to_lowercase(), u))
            .collect();
        let desired: BTreeMap<String, &UserSpec> = spec
            .users
            .iter()
            .map(|u| (u.username.to_lowercase(), u))
            .collect();

        for key in pair_diff(observed.keys().cloned(), desired.keys().cloned()).into_keys() {
            match (observed.get(&key), desired.get(&key)) {
                (Some(remote), None) => match self.defaults.default_user(&remote.username) {
                    Some(default) => {
                        let id = user_id(remote)?;
                        self.sync_mappings(&remote.username, &id, &default.roles, &roles, true, report)
                            .await?;
                    }
                    None => {
                        self.keycloak.delete_user(self.realm, &user_id(remote)?).await?;
                        info!("Deleted user {} from realm {}", remote.username, self.realm);
                        report.users_deleted += 1;
                    }
                },
                (None, Some(user)) => {
                    let id = self.create_user(user).await?;
                    report.users_created += 1;
                    self.sync_mappings(&user.username, &id, &user.roles, &roles, true, report)
                        .await?;
                }
                (Some(remote), Some(user)) => {
                    let id = user_id(remote)?;
                    self.sync_mappings(&user.username, &id, &user.roles, &roles, true, report)
                        .await?;
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// Remove the spec's own users and roles, leaving defaults in place.
    /// Objects that are already gone are skipped.
    pub async fn remove_declared(&self, spec: &RhpamIdentitySpec) -> Result<ConvergenceReport, KeycloakError> {
        let mut report = ConvergenceReport::default();

        for user in spec.users.iter().filter(|u| !self.defaults.is_default_user(&u.username)) {
            let Some(remote) = self.keycloak.find_user_by_username(self.realm, &user.username).await? else {
                continue;
            };
            match self.keycloak.delete_user(self.realm, &user_id(&remote)?).await {
                Ok(()) => report.users_deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        for role in spec.roles.iter().filter(|r| !self.defaults.is_protected_role(&r.name)) {
            match self.keycloak.delete_role(self.realm, &role.name).await {
                Ok(()) => report.roles_deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Realm-level roles by name
    async fn realm_roles(&self) -> Result<BTreeMap<String, RoleRepresentation>, KeycloakError> {
        Ok(self
            .keycloak
            .list_roles(self.realm)
            .await?
            .into_iter()
            .filter(|r| !r.client_role)
            .map(|r| (r.name.clone(), r))
            .collect())
    }

    async fn create_user(&self, user: &UserSpec) -> Result<String, KeycloakError> {
        self.keycloak
            .create_user(self.realm, &UserRepresentation::with_password(&user.username, &user.password))
            .await?;
        info!("Created user {} in realm {}", user.username, self.realm);
        let created = self
            .keycloak
            .find_user_by_username(self.realm, &user.username)
            .await?
            .ok_or_else(|| KeycloakError::NotFound(format!("user {} in realm {}", user.username, self.realm)))?;
        user_id(&created)
    }

    /// Pair diff of one user's realm-role mappings. With `remove_extra` unset
    /// only missing mappings are added. System roles are never unmapped.
    async fn sync_mappings(
        &self,
        username: &str,
        user_id: &str,
        desired: &[String],
        roles: &BTreeMap<String, RoleRepresentation>,
        remove_extra: bool,
        report: &mut ConvergenceReport,
    ) -> Result<(), KeycloakError> {
        let observed: BTreeMap<String, RoleRepresentation> = self
            .keycloak
            .get_user_realm_role_mappings(self.realm, user_id)
            .await?
            .into_iter()
            .filter(|r| !r.client_role)
            .map(|r| (r.name.clone(), r))
            .collect();

        for (name, presence) in pair_diff(observed.keys().cloned(), desired.iter().cloned()) {
            match (presence.observed, presence.desired) {
                (false, true) => {
                    let role = roles.get(&name).cloned().ok_or_else(|| {
                        KeycloakError::NotFound(format!("role {name} in realm {}", self.realm))
                    })?;
                    self.keycloak
                        .create_user_realm_role_mapping(self.realm, user_id, &[role])
                        .await?;
                    debug!("Mapped role {} to user {}", name, username);
                    report.mappings_added += 1;
                }
                (true, false) if remove_extra && !is_system_role(&name) => {
                    let role = observed.get(&name).cloned().unwrap_or_else(|| RoleRepresentation::named(&name));
                    self.keycloak
                        .delete_user_realm_role_mapping(self.realm, user_id, &[role])
                        .await?;
                    debug!("Unmapped role {} from user {}", name, username);
                    report.mappings_removed += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn user_id(user: &UserRepresentation) -> Result<String, KeycloakError> {
    user.id
        .clone()
        .ok_or_else(|| KeycloakError::InvalidRequest(format!("user {} has no id", user.username)))
}

#[cfg(test)]
#[path = "convergence_test.rs"]
mod convergence_test;
