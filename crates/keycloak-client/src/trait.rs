//! KeycloakClient traits for mocking
//!
//! `KeycloakClientTrait` is an authenticated session against one Keycloak
//! server. `KeycloakClientFactory` produces such sessions from admin
//! credentials, so the operator can log in once per reconciliation pass and
//! tests can hand out an in-memory implementation instead.

use crate::error::KeycloakError;
use crate::models::*;
use std::sync::Arc;

/// Trait for Keycloak admin API operations
///
/// All methods address realm-level objects. Client scoped roles are never
/// returned by the role or role-mapping calls.
#[async_trait::async_trait]
pub trait KeycloakClientTrait: Send + Sync {
    // Realms
    async fn create_realm(&self, realm: &RealmRepresentation) -> Result<(), KeycloakError>;
    async fn delete_realm(&self, realm: &str) -> Result<(), KeycloakError>;

    // OAuth clients
    async fn create_client(&self, realm: &str, client: &ClientRepresentation) -> Result<(), KeycloakError>;
    async fn list_clients(&self, realm: &str) -> Result<Vec<ClientRepresentation>, KeycloakError>;
    /// `id` is the server generated id, not the `clientId`
    async fn get_client_secret(&self, realm: &str, id: &str) -> Result<ClientSecret, KeycloakError>;

    // Roles
    async fn create_role(&self, realm: &str, role: &RoleRepresentation) -> Result<(), KeycloakError>;
    async fn get_role(&self, realm: &str, name: &str) -> Result<Option<RoleRepresentation>, KeycloakError>;
    async fn list_roles(&self, realm: &str) -> Result<Vec<RoleRepresentation>, KeycloakError>;
    async fn delete_role(&self, realm: &str, name: &str) -> Result<(), KeycloakError>;

    // Users
    async fn create_user(&self, realm: &str, user: &UserRepresentation) -> Result<(), KeycloakError>;
    async fn find_user_by_username(&self, realm: &str, username: &str) -> Result<Option<UserRepresentation>, KeycloakError>;
    async fn list_users(&self, realm: &str) -> Result<Vec<UserRepresentation>, KeycloakError>;
    async fn delete_user(&self, realm: &str, user_id: &str) -> Result<(), KeycloakError>;

    // Realm role mappings
    async fn get_user_realm_role_mappings(&self, realm: &str, user_id: &str) -> Result<Vec<RoleRepresentation>, KeycloakError>;
    async fn create_user_realm_role_mapping(&self, realm: &str, user_id: &str, roles: &[RoleRepresentation]) -> Result<(), KeycloakError>;
    async fn delete_user_realm_role_mapping(&self, realm: &str, user_id: &str, roles: &[RoleRepresentation]) -> Result<(), KeycloakError>;

    /// Looks up a client by its `clientId` and returns its generated secret.
    async fn client_secret_for(&self, realm: &str, client_id: &str) -> Result<String, KeycloakError> {
        let client = self
            .list_clients(realm)
            .await?
            .into_iter()
            .find(|c| c.client_id == client_id)
            .ok_or_else(|| KeycloakError::NotFound(format!("client {client_id} in realm {realm}")))?;
        let id = client
            .id
            .ok_or_else(|| KeycloakError::InvalidRequest(format!("client {client_id} has no id")))?;
        Ok(self.get_client_secret(realm, &id).await?.value)
    }
}

/// Produces authenticated sessions
#[async_trait::async_trait]
pub trait KeycloakClientFactory: Send + Sync {
    /// Logs in with the admin password grant and returns a session bound to
    /// the resulting token.
    async fn authenticate(&self, credentials: &AdminCredentials) -> Result<Arc<dyn KeycloakClientTrait>, KeycloakError>;
}
