//! Keycloak Admin REST API Client
//!
//! A thin client for the Keycloak (RH-SSO) admin API covering realms, OAuth
//! clients, realm roles, users and realm role mappings.
//!
//! # Example
//!
//! ```no_run
//! use keycloak_client::{
//!     AdminCredentials, KeycloakClientFactory, KeycloakClientTrait, KeycloakConnector, RoleRepresentation,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = KeycloakConnector::new(false)?;
//! let client = connector
//!     .authenticate(&AdminCredentials {
//!         username: "admin".to_string(),
//!         password: "admin".to_string(),
//!         base_url: "https://sso.example.com".to_string(),
//!     })
//!     .await?;
//!
//! client.create_role("myrealm", &RoleRepresentation::named("viewer")).await?;
//! if let Some(user) = client.find_user_by_username("myrealm", "alice").await? {
//!     println!("alice has id {:?}", user.id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every call checks the HTTP status against the one the operation is
//! expected to return and maps mismatches to [`KeycloakError`]. A 409 on a
//! create becomes [`KeycloakError::Conflict`], a 404 becomes
//! [`KeycloakError::NotFound`], and lookups return `Option`.

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod keycloak_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{DEFAULT_TIMEOUT, KeycloakClient, KeycloakConnector};
pub use error::KeycloakError;
pub use models::*;
pub use keycloak_trait::{KeycloakClientFactory, KeycloakClientTrait};
#[cfg(feature = "test-util")]
pub use mock::{MockCall, MockKeycloakClient};
