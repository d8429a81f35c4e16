//! RhpamIdentity CRD
//!
//! Declares the roles and users that should exist in the realm of the
//! `RhpamEnvironment` living in the same namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "rhpam.microscaler.io",
    version = "v1alpha1",
    kind = "RhpamIdentity",
    namespaced,
    status = "RhpamIdentityStatus",
    shortname = "rhpamid",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Realm","type":"string","jsonPath":".status.realm"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RhpamIdentitySpec {
    /// Realm roles, in creation order
    #[serde(default)]
    pub roles: Vec<RoleSpec>,

    /// Realm users and the roles each of them holds
    #[serde(default)]
    pub users: Vec<UserSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    pub username: String,

    /// Initial password, only used when the user is created
    pub password: String,

    /// Realm role names
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RhpamIdentityStatus {
    #[serde(default)]
    pub phase: IdentityPhase,

    /// Realm copied from the owning environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Lifecycle phase of an [`RhpamIdentity`]
///
/// `Reconcile` is the steady state: every pass re-runs convergence and stays
/// there.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub enum IdentityPhase {
    #[default]
    #[serde(rename = "")]
    NoPhase,

    #[serde(alias = "accepted")]
    Accepted,

    #[serde(alias = "reconcile")]
    Reconcile,

    #[serde(alias = "deprovisioned")]
    Deprovisioned,

    #[serde(alias = "deprovision failed")]
    DeprovisionFailed,
}

impl IdentityPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoPhase => "",
            Self::Accepted => "Accepted",
            Self::Reconcile => "Reconcile",
            Self::Deprovisioned => "Deprovisioned",
            Self::DeprovisionFailed => "DeprovisionFailed",
        }
    }
}

impl fmt::Display for IdentityPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPhase => f.write_str("NoPhase"),
            other => f.write_str(other.as_str()),
        }
    }
}
