//! Keycloak client errors

use thiserror::Error;

/// Errors that can occur when talking to the Keycloak admin API
#[derive(Debug, Error)]
pub enum KeycloakError {
    /// Transport failure (connect, timeout, TLS, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Admin login rejected or token response carried an error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A create call hit an object that already exists (HTTP 409)
    #[error("{resource} already exists")]
    Conflict { resource: String },

    /// Addressed object does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The API answered with a status other than the one expected for the call
    #[error("Unexpected response for {resource}: {status} {status_text}")]
    UnexpectedStatus {
        resource: String,
        status: u16,
        status_text: String,
    },

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl KeycloakError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
