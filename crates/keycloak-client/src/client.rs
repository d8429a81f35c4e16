//! Keycloak admin API client
//!
//! Implements the subset of the Keycloak admin REST API the operator needs.
//! Admin endpoints live under `/auth/admin/realms/{realm}/...`, the admin
//! token comes from the password grant on the master realm.

use crate::error::KeycloakError;
use crate::keycloak_trait::{KeycloakClientFactory, KeycloakClientTrait};
use crate::models::*;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TOKEN_PATH: &str = "/auth/realms/master/protocol/openid-connect/token";
const ADMIN_PATH: &str = "/auth/admin/realms";
const ADMIN_CLIENT_ID: &str = "admin-cli";
const USER_PAGE_SIZE: usize = 100;

/// Per-request timeout used by [`KeycloakConnector::new`]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authenticated Keycloak admin session
pub struct KeycloakClient {
    client: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for KeycloakClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeycloakClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KeycloakClient {
    /// Log in with the password grant against the master realm
    ///
    /// # Arguments
    /// * `client` - HTTP client to reuse (carries timeout and TLS settings)
    /// * `base_url` - Keycloak server root (e.g., "https://sso.example.com")
    /// * `username` / `password` - master realm admin credentials
    pub async fn login(
        client: Client,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, KeycloakError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let url = format!("{base_url}{TOKEN_PATH}");
        debug!("Requesting admin token from {}", url);

        let response = client
            .post(&url)
            .form(&[
                ("username", username),
                ("password", password),
                ("grant_type", "password"),
                ("client_id", ADMIN_CLIENT_ID),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(KeycloakError::Authentication(format!(
                "admin login for {username} rejected by {base_url}"
            )));
        }
        let response = check(response, None, "admin token").await?;
        let token: TokenResponse = serde_json::from_str(&response.text().await?)?;

        if let Some(error) = token.error {
            return Err(KeycloakError::Authentication(match token.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            }));
        }
        let token = token.access_token.ok_or_else(|| {
            KeycloakError::Authentication("token response did not contain an access token".to_string())
        })?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn admin_url(&self, path: &str) -> String {
        format!("{}{ADMIN_PATH}{path}", self.base_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.admin_url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        expected: Option<StatusCode>,
        resource: &str,
    ) -> Result<T, KeycloakError> {
        debug!("GET {}", path);
        let response = self.request(Method::GET, path).send().await?;
        let response = check(response, expected, resource).await?;
        Ok(serde_json::from_str(&response.text().await?)?)
    }

    async fn post_json<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        expected: StatusCode,
        resource: &str,
    ) -> Result<(), KeycloakError> {
        debug!("POST {}", path);
        let response = self.request(Method::POST, path).json(body).send().await?;
        check(response, Some(expected), resource).await?;
        Ok(())
    }

    async fn delete(
        &self,
        path: &str,
        body: Option<&[RoleRepresentation]>,
        resource: &str,
    ) -> Result<(), KeycloakError> {
        debug!("DELETE {}", path);
        let mut request = self.request(Method::DELETE, path);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        check(response, Some(StatusCode::NO_CONTENT), resource).await?;
        Ok(())
    }
}

/// Turn any response whose status differs from `expected` (or is not 2xx when
/// `expected` is `None`) into a typed error.
async fn check(
    response: Response,
    expected: Option<StatusCode>,
    resource: &str,
) -> Result<Response, KeycloakError> {
    let status = response.status();
    let ok = match expected {
        Some(expected) => status == expected,
        None => status.is_success(),
    };
    if ok {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!("Unexpected response for {}: {} - {}", resource, status, body);
    Err(match status {
        StatusCode::CONFLICT => KeycloakError::Conflict {
            resource: resource.to_string(),
        },
        StatusCode::NOT_FOUND => KeycloakError::NotFound(resource.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            KeycloakError::Authentication(format!("{status} while accessing {resource}"))
        }
        _ => KeycloakError::UnexpectedStatus {
            resource: resource.to_string(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
        },
    })
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

#[async_trait::async_trait]
impl KeycloakClientTrait for KeycloakClient {
    async fn create_realm(&self, realm: &RealmRepresentation) -> Result<(), KeycloakError> {
        let resource = format!("realm {}", realm.realm);
        self.post_json("", realm, StatusCode::CREATED, &resource).await
    }

    async fn delete_realm(&self, realm: &str) -> Result<(), KeycloakError> {
        self.delete(&format!("/{}", enc(realm)), None, &format!("realm {realm}"))
            .await
    }

    async fn create_client(&self, realm: &str, client: &ClientRepresentation) -> Result<(), KeycloakError> {
        let resource = format!("client {}", client.client_id);
        self.post_json(&format!("/{}/clients", enc(realm)), client, StatusCode::CREATED, &resource)
            .await
    }

    async fn list_clients(&self, realm: &str) -> Result<Vec<ClientRepresentation>, KeycloakError> {
        self.get_json(&format!("/{}/clients", enc(realm)), None, &format!("clients of realm {realm}"))
            .await
    }

    async fn get_client_secret(&self, realm: &str, id: &str) -> Result<ClientSecret, KeycloakError> {
        self.get_json(
            &format!("/{}/clients/{}/client-secret", enc(realm), enc(id)),
            Some(StatusCode::OK),
            &format!("secret of client {id}"),
        )
        .await
    }

    async fn create_role(&self, realm: &str, role: &RoleRepresentation) -> Result<(), KeycloakError> {
        let resource = format!("role {}", role.name);
        self.post_json(&format!("/{}/roles", enc(realm)), role, StatusCode::CREATED, &resource)
            .await
    }

    async fn get_role(&self, realm: &str, name: &str) -> Result<Option<RoleRepresentation>, KeycloakError> {
        match self
            .get_json(
                &format!("/{}/roles/{}", enc(realm), enc(name)),
                Some(StatusCode::OK),
                &format!("role {name}"),
            )
            .await
        {
            Ok(role) => Ok(Some(role)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_roles(&self, realm: &str) -> Result<Vec<RoleRepresentation>, KeycloakError> {
        self.get_json(&format!("/{}/roles", enc(realm)), None, &format!("roles of realm {realm}"))
            .await
    }

    async fn delete_role(&self, realm: &str, name: &str) -> Result<(), KeycloakError> {
        self.delete(&format!("/{}/roles/{}", enc(realm), enc(name)), None, &format!("role {name}"))
            .await
    }

    async fn create_user(&self, realm: &str, user: &UserRepresentation) -> Result<(), KeycloakError> {
        let resource = format!("user {}", user.username);
        self.post_json(&format!("/{}/users", enc(realm)), user, StatusCode::CREATED, &resource)
            .await
    }

    async fn find_user_by_username(&self, realm: &str, username: &str) -> Result<Option<UserRepresentation>, KeycloakError> {
        let users: Vec<UserRepresentation> = self
            .get_json(
                &format!("/{}/users?username={}&exact=true", enc(realm), enc(username)),
                Some(StatusCode::OK),
                &format!("user {username}"),
            )
            .await?;
        // Keycloak stores usernames lowercased
        Ok(users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username)))
    }

    async fn list_users(&self, realm: &str) -> Result<Vec<UserRepresentation>, KeycloakError> {
        let mut all_users = Vec::new();
        let mut first = 0;
        loop {
            let page: Vec<UserRepresentation> = self
                .get_json(
                    &format!("/{}/users?first={first}&max={USER_PAGE_SIZE}", enc(realm)),
                    None,
                    &format!("users of realm {realm}"),
                )
                .await?;
            let fetched = page.len();
            all_users.extend(page);
            if fetched < USER_PAGE_SIZE {
                break;
            }
            first += fetched;
        }
        Ok(all_users)
    }

    async fn delete_user(&self, realm: &str, user_id: &str) -> Result<(), KeycloakError> {
        self.delete(&format!("/{}/users/{}", enc(realm), enc(user_id)), None, &format!("user {user_id}"))
            .await
    }

    async fn get_user_realm_role_mappings(&self, realm: &str, user_id: &str) -> Result<Vec<RoleRepresentation>, KeycloakError> {
        self.get_json(
            &format!("/{}/users/{}/role-mappings/realm", enc(realm), enc(user_id)),
            None,
            &format!("role mappings of user {user_id}"),
        )
        .await
    }

    async fn create_user_realm_role_mapping(&self, realm: &str, user_id: &str, roles: &[RoleRepresentation]) -> Result<(), KeycloakError> {
        self.post_json(
            &format!("/{}/users/{}/role-mappings/realm", enc(realm), enc(user_id)),
            roles,
            StatusCode::NO_CONTENT,
            &format!("role mappings of user {user_id}"),
        )
        .await
    }

    async fn delete_user_realm_role_mapping(&self, realm: &str, user_id: &str, roles: &[RoleRepresentation]) -> Result<(), KeycloakError> {
        self.delete(
            &format!("/{}/users/{}/role-mappings/realm", enc(realm), enc(user_id)),
            Some(roles),
            &format!("role mappings of user {user_id}"),
        )
        .await
    }
}

/// Creates [`KeycloakClient`] sessions sharing one connection pool
#[derive(Debug, Clone)]
pub struct KeycloakConnector {
    http: Client,
}

impl KeycloakConnector {
    /// Connector with the default 10 second request timeout
    ///
    /// `accept_invalid_certs` disables TLS verification, for SSO servers
    /// fronted by cluster-internal certificates.
    pub fn new(accept_invalid_certs: bool) -> Result<Self, KeycloakError> {
        Self::with_timeout(DEFAULT_TIMEOUT, accept_invalid_certs)
    }

    pub fn with_timeout(timeout: Duration, accept_invalid_certs: bool) -> Result<Self, KeycloakError> {
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl KeycloakClientFactory for KeycloakConnector {
    async fn authenticate(&self, credentials: &AdminCredentials) -> Result<Arc<dyn KeycloakClientTrait>, KeycloakError> {
        let client = KeycloakClient::login(
            self.http.clone(),
            &credentials.base_url,
            &credentials.username,
            &credentials.password,
        )
        .await?;
        Ok(Arc::new(client))
    }
}
