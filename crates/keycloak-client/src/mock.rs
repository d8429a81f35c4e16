//! Mock KeycloakClient for unit testing
//!
//! An in-memory Keycloak that answers like the real admin API: duplicate
//! creates return `Conflict`, unknown realms/roles/users return `NotFound`,
//! and new realms come with Keycloak's built-in roles. Every write is
//! recorded so tests can assert exactly which calls were issued.
//!
//! The same value implements [`KeycloakClientFactory`]; every session it hands
//! out shares the in-memory state.

use crate::error::KeycloakError;
use crate::keycloak_trait::{KeycloakClientFactory, KeycloakClientTrait};
use crate::models::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// A write issued against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateRealm(String),
    DeleteRealm(String),
    CreateClient { realm: String, client_id: String },
    CreateRole { realm: String, name: String },
    DeleteRole { realm: String, name: String },
    CreateUser { realm: String, username: String },
    DeleteUser { realm: String, username: String },
    AddRoleMapping { realm: String, username: String, role: String },
    RemoveRoleMapping { realm: String, username: String, role: String },
}

impl MockCall {
    /// Whether the call removes something
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::DeleteRealm(_)
                | Self::DeleteRole { .. }
                | Self::DeleteUser { .. }
                | Self::RemoveRoleMapping { .. }
        )
    }
}

#[derive(Debug, Default)]
struct MockRealm {
    clients: Vec<ClientRepresentation>,
    client_secrets: BTreeMap<String, String>,
    roles: BTreeMap<String, RoleRepresentation>,
    /// user id -> user
    users: BTreeMap<String, UserRepresentation>,
    /// user id -> realm role names
    mappings: BTreeMap<String, BTreeSet<String>>,
}

impl MockRealm {
    fn with_builtin_roles(name: &str) -> Self {
        let mut realm = Self::default();
        for role in [
            "offline_access".to_string(),
            "uma_authorization".to_string(),
            format!("default-roles-{name}"),
        ] {
            realm.insert_role(&role);
        }
        realm
    }

    fn insert_role(&mut self, name: &str) {
        self.roles.insert(
            name.to_string(),
            RoleRepresentation {
                id: Some(uuid::Uuid::new_v4().to_string()),
                ..RoleRepresentation::named(name)
            },
        );
    }

    fn user_id(&self, username: &str) -> Option<String> {
        self.users
            .iter()
            .find(|(_, u)| u.username == username)
            .map(|(id, _)| id.clone())
    }

    fn username(&self, user_id: &str) -> Result<String, KeycloakError> {
        self.users
            .get(user_id)
            .map(|u| u.username.clone())
            .ok_or_else(|| KeycloakError::NotFound(format!("user {user_id}")))
    }
}

#[derive(Debug, Default)]
struct MockState {
    realms: BTreeMap<String, MockRealm>,
    calls: Vec<MockCall>,
    failing: HashSet<String>,
    logins: Vec<AdminCredentials>,
    reject_logins: bool,
}

/// Mock KeycloakClient for testing
#[derive(Clone, Debug, Default)]
pub struct MockKeycloakClient {
    state: Arc<Mutex<MockState>>,
}

impl MockKeycloakClient {
    /// Create a new mock with no realms
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only happens after a test already panicked
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fail_if_configured(state: &MockState, operation: &str, resource: &str) -> Result<(), KeycloakError> {
        if state.failing.contains(operation) {
            return Err(KeycloakError::UnexpectedStatus {
                resource: resource.to_string(),
                status: 500,
                status_text: "Internal Server Error".to_string(),
            });
        }
        Ok(())
    }

    fn realm_mut<'a>(state: &'a mut MockState, realm: &str) -> Result<&'a mut MockRealm, KeycloakError> {
        state
            .realms
            .get_mut(realm)
            .ok_or_else(|| KeycloakError::NotFound(format!("realm {realm}")))
    }

    // Setup helpers

    /// Make every call of the named trait method fail with HTTP 500
    pub fn fail_operation(&self, operation: &str) {
        self.lock().failing.insert(operation.to_string());
    }

    /// Undo [`Self::fail_operation`]
    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Make `authenticate` fail as if the admin password were wrong
    pub fn reject_logins(&self) {
        self.lock().reject_logins = true;
    }

    /// Add a realm (with Keycloak's built-in roles) without recording a call
    pub fn add_realm(&self, realm: &str) {
        self.lock()
            .realms
            .entry(realm.to_string())
            .or_insert_with(|| MockRealm::with_builtin_roles(realm));
    }

    /// Add a realm role without recording a call
    pub fn add_role(&self, realm: &str, name: &str) {
        let mut state = self.lock();
        state
            .realms
            .entry(realm.to_string())
            .or_insert_with(|| MockRealm::with_builtin_roles(realm))
            .insert_role(name);
    }

    /// Add a user holding `roles` without recording calls. Missing roles are
    /// created. Returns the generated user id.
    pub fn add_user(&self, realm: &str, username: &str, roles: &[&str]) -> String {
        let mut state = self.lock();
        let realm_state = state
            .realms
            .entry(realm.to_string())
            .or_insert_with(|| MockRealm::with_builtin_roles(realm));
        let id = uuid::Uuid::new_v4().to_string();
        realm_state.users.insert(
            id.clone(),
            UserRepresentation {
                id: Some(id.clone()),
                username: username.to_string(),
                enabled: true,
                credentials: Vec::new(),
            },
        );
        for role in roles {
            if !realm_state.roles.contains_key(*role) {
                realm_state.insert_role(role);
            }
        }
        realm_state
            .mappings
            .insert(id.clone(), roles.iter().map(ToString::to_string).collect());
        id
    }

    // Inspection helpers

    /// All writes issued so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    #[must_use]
    pub fn logins(&self) -> Vec<AdminCredentials> {
        self.lock().logins.clone()
    }

    #[must_use]
    pub fn has_realm(&self, realm: &str) -> bool {
        self.lock().realms.contains_key(realm)
    }

    #[must_use]
    pub fn realm_names(&self) -> Vec<String> {
        self.lock().realms.keys().cloned().collect()
    }

    #[must_use]
    pub fn role_names(&self, realm: &str) -> BTreeSet<String> {
        self.lock()
            .realms
            .get(realm)
            .map(|r| r.roles.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn usernames(&self, realm: &str) -> BTreeSet<String> {
        self.lock()
            .realms
            .get(realm)
            .map(|r| r.users.values().map(|u| u.username.clone()).collect())
            .unwrap_or_default()
    }

    /// Realm roles mapped to `username`
    #[must_use]
    pub fn user_roles(&self, realm: &str, username: &str) -> BTreeSet<String> {
        let state = self.lock();
        state
            .realms
            .get(realm)
            .and_then(|r| r.user_id(username).and_then(|id| r.mappings.get(&id).cloned()))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn clients(&self, realm: &str) -> Vec<ClientRepresentation> {
        self.lock()
            .realms
            .get(realm)
            .map(|r| r.clients.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl KeycloakClientTrait for MockKeycloakClient {
    async fn create_realm(&self, realm: &RealmRepresentation) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "create_realm", &realm.realm)?;
        if state.realms.contains_key(&realm.realm) {
            return Err(KeycloakError::Conflict {
                resource: format!("realm {}", realm.realm),
            });
        }
        state
            .realms
            .insert(realm.realm.clone(), MockRealm::with_builtin_roles(&realm.realm));
        state.calls.push(MockCall::CreateRealm(realm.realm.clone()));
        Ok(())
    }

    async fn delete_realm(&self, realm: &str) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "delete_realm", realm)?;
        if state.realms.remove(realm).is_none() {
            return Err(KeycloakError::NotFound(format!("realm {realm}")));
        }
        state.calls.push(MockCall::DeleteRealm(realm.to_string()));
        Ok(())
    }

    async fn create_client(&self, realm: &str, client: &ClientRepresentation) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "create_client", &client.client_id)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        if realm_state.clients.iter().any(|c| c.client_id == client.client_id) {
            return Err(KeycloakError::Conflict {
                resource: format!("client {}", client.client_id),
            });
        }
        let id = uuid::Uuid::new_v4().to_string();
        // confidential clients, bearer-only included, get a generated secret
        if !client.public_client {
            realm_state
                .client_secrets
                .insert(id.clone(), uuid::Uuid::new_v4().to_string());
        }
        realm_state.clients.push(ClientRepresentation {
            id: Some(id),
            ..client.clone()
        });
        state.calls.push(MockCall::CreateClient {
            realm: realm.to_string(),
            client_id: client.client_id.clone(),
        });
        Ok(())
    }

    async fn list_clients(&self, realm: &str) -> Result<Vec<ClientRepresentation>, KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "list_clients", realm)?;
        Ok(Self::realm_mut(&mut state, realm)?.clients.clone())
    }

    async fn get_client_secret(&self, realm: &str, id: &str) -> Result<ClientSecret, KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "get_client_secret", id)?;
        let value = Self::realm_mut(&mut state, realm)?
            .client_secrets
            .get(id)
            .cloned()
            .ok_or_else(|| KeycloakError::NotFound(format!("secret of client {id}")))?;
        Ok(ClientSecret {
            kind: Some("secret".to_string()),
            value,
        })
    }

    async fn create_role(&self, realm: &str, role: &RoleRepresentation) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "create_role", &role.name)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        if realm_state.roles.contains_key(&role.name) {
            return Err(KeycloakError::Conflict {
                resource: format!("role {}", role.name),
            });
        }
        realm_state.insert_role(&role.name);
        state.calls.push(MockCall::CreateRole {
            realm: realm.to_string(),
            name: role.name.clone(),
        });
        Ok(())
    }

    async fn get_role(&self, realm: &str, name: &str) -> Result<Option<RoleRepresentation>, KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "get_role", name)?;
        Ok(Self::realm_mut(&mut state, realm)?.roles.get(name).cloned())
    }

    async fn list_roles(&self, realm: &str) -> Result<Vec<RoleRepresentation>, KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "list_roles", realm)?;
        Ok(Self::realm_mut(&mut state, realm)?.roles.values().cloned().collect())
    }

    async fn delete_role(&self, realm: &str, name: &str) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "delete_role", name)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        if realm_state.roles.remove(name).is_none() {
            return Err(KeycloakError::NotFound(format!("role {name}")));
        }
        for roles in realm_state.mappings.values_mut() {
            roles.remove(name);
        }
        state.calls.push(MockCall::DeleteRole {
            realm: realm.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn create_user(&self, realm: &str, user: &UserRepresentation) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "create_user", &user.username)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        if realm_state.user_id(&user.username).is_some() {
            return Err(KeycloakError::Conflict {
                resource: format!("user {}", user.username),
            });
        }
        let id = uuid::Uuid::new_v4().to_string();
        realm_state.users.insert(
            id.clone(),
            UserRepresentation {
                id: Some(id.clone()),
                credentials: Vec::new(),
                ..user.clone()
            },
        );
        realm_state.mappings.insert(id, BTreeSet::new());
        state.calls.push(MockCall::CreateUser {
            realm: realm.to_string(),
            username: user.username.clone(),
        });
        Ok(())
    }

    async fn find_user_by_username(&self, realm: &str, username: &str) -> Result<Option<UserRepresentation>, KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "find_user_by_username", username)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        Ok(realm_state
            .user_id(username)
            .and_then(|id| realm_state.users.get(&id).cloned()))
    }

    async fn list_users(&self, realm: &str) -> Result<Vec<UserRepresentation>, KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "list_users", realm)?;
        Ok(Self::realm_mut(&mut state, realm)?.users.values().cloned().collect())
    }

    async fn delete_user(&self, realm: &str, user_id: &str) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "delete_user", user_id)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        let user = realm_state
            .users
            .remove(user_id)
            .ok_or_else(|| KeycloakError::NotFound(format!("user {user_id}")))?;
        realm_state.mappings.remove(user_id);
        state.calls.push(MockCall::DeleteUser {
            realm: realm.to_string(),
            username: user.username,
        });
        Ok(())
    }

    async fn get_user_realm_role_mappings(&self, realm: &str, user_id: &str) -> Result<Vec<RoleRepresentation>, KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "get_user_realm_role_mappings", user_id)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        realm_state.username(user_id)?;
        Ok(realm_state
            .mappings
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|name| realm_state.roles.get(name).cloned())
            .collect())
    }

    async fn create_user_realm_role_mapping(&self, realm: &str, user_id: &str, roles: &[RoleRepresentation]) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "create_user_realm_role_mapping", user_id)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        let username = realm_state.username(user_id)?;
        if let Some(missing) = roles.iter().find(|r| !realm_state.roles.contains_key(&r.name)) {
            return Err(KeycloakError::NotFound(format!("role {}", missing.name)));
        }
        let mapped = realm_state.mappings.entry(user_id.to_string()).or_default();
        for role in roles {
            mapped.insert(role.name.clone());
        }
        for role in roles {
            state.calls.push(MockCall::AddRoleMapping {
                realm: realm.to_string(),
                username: username.clone(),
                role: role.name.clone(),
            });
        }
        Ok(())
    }

    async fn delete_user_realm_role_mapping(&self, realm: &str, user_id: &str, roles: &[RoleRepresentation]) -> Result<(), KeycloakError> {
        let mut state = self.lock();
        Self::fail_if_configured(&state, "delete_user_realm_role_mapping", user_id)?;
        let realm_state = Self::realm_mut(&mut state, realm)?;
        let username = realm_state.username(user_id)?;
        let mapped = realm_state.mappings.entry(user_id.to_string()).or_default();
        for role in roles {
            mapped.remove(&role.name);
        }
        for role in roles {
            state.calls.push(MockCall::RemoveRoleMapping {
                realm: realm.to_string(),
                username: username.clone(),
                role: role.name.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeycloakClientFactory for MockKeycloakClient {
    async fn authenticate(&self, credentials: &AdminCredentials) -> Result<Arc<dyn KeycloakClientTrait>, KeycloakError> {
        let mut state = self.lock();
        if state.reject_logins {
            return Err(KeycloakError::Authentication(format!(
                "admin login for {} rejected",
                credentials.username
            )));
        }
        state.logins.push(credentials.clone());
        drop(state);
        Ok(Arc::new(self.clone()))
    }
}
