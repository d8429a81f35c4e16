//! Controller-specific error types.
//!
//! Errors raised by the RHPAM operator that are not covered by the cluster
//! or Keycloak client errors.

use crate::cluster::ClusterError;
use crds::SpecValidationError;
use keycloak_client::KeycloakError;
use thiserror::Error;

/// Errors that can occur in the RHPAM operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Cluster(#[from] ClusterError),

    /// Keycloak admin API error
    #[error("Keycloak error: {0}")]
    Keycloak(#[from] KeycloakError),

    /// Missing environment variable or unusable secret content
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The resource spec failed validation
    #[error("Invalid spec: {0}")]
    Validation(#[from] SpecValidationError),

    /// A manifest could not be rendered or decoded
    #[error("Template error: {0}")]
    Template(String),

    /// A handler produced a phase the transition table does not allow
    #[error("Illegal {kind} phase transition from {from} to {to}")]
    IllegalTransition {
        kind: &'static str,
        from: String,
        to: String,
    },

    /// A resource is missing metadata required to address it
    #[error("Resource is missing {0}")]
    MissingMetadata(&'static str),

    /// Serialization of a status or manifest failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Teardown of remote state failed; the finalizer is kept
    #[error("Deprovisioning failed: {0}")]
    Deprovision(String),

    /// Metrics server socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Short label used for the `outcome` metric dimension
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Cluster(_) => "cluster_error",
            Self::Keycloak(_) => "keycloak_error",
            Self::InvalidConfig(_) => "config_error",
            Self::Validation(_) => "validation_error",
            Self::Template(_) => "template_error",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::MissingMetadata(_) | Self::Serialization(_) => "invalid_resource",
            Self::Deprovision(_) => "deprovision_error",
            Self::Io(_) => "io_error",
            Self::Watch(_) => "watch_error",
        }
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Template(e.to_string())
    }
}
