//! RhpamEnvironment CRD
//!
//! One instance of the process automation stack: a PostgreSQL database,
//! Business Central and a KIE server, plus the SSO realm they authenticate
//! against. The operator walks the resource through [`EnvironmentPhase`]
//! until it reaches `Complete`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Finalizer shared by both RHPAM resource kinds.
pub const FINALIZER: &str = "finalizer.rhpam";

/// Version marker written into every status by the operator.
pub const RHPAM_VERSION: &str = "7.1.1.GA";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "rhpam.microscaler.io",
    version = "v1alpha1",
    kind = "RhpamEnvironment",
    namespaced,
    status = "RhpamEnvironmentStatus",
    shortname = "rhpamenv",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Realm","type":"string","jsonPath":".status.realm"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RhpamEnvironmentSpec {
    /// Hostname suffix used for the generated routes
    /// (`<deployment>-<namespace>.<domain>`)
    pub domain: String,

    /// Per-component overrides. Anything left out falls back to the defaults
    /// applied by [`RhpamEnvironmentSpec::with_defaults`].
    #[serde(default)]
    pub config: RhpamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RhpamConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub business_central: BusinessCentralConfig,

    #[serde(default)]
    pub kie_server: KieServerConfig,
}

/// PostgreSQL tuning
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_capacity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_buffers: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_prepared_transactions: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Business Central (authoring UI) resources and JVM flags
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusinessCentralConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_capacity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,

    /// `GC_MAX_METASPACE_SIZE` in megabytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_max_meta_size: Option<u32>,

    /// `enabled` or `disabled`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kie_mbeans: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_opts_append: Option<String>,
}

/// KIE server (execution engine) resources and runtime flags
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KieServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_max_meta_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kie_mbeans: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kie_server_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_classes: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_auth_user: Option<bool>,
}

/// Spec validation failures. Only raised while a resource is being accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecValidationError {
    #[error("spec.domain must not be empty")]
    EmptyDomain,

    #[error("spec.domain {0:?} is not a valid DNS name")]
    InvalidDomain(String),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be \"enabled\" or \"disabled\", got {value:?}")]
    InvalidToggle { field: &'static str, value: String },
}

fn fill(slot: &mut Option<String>, default: &str) {
    if slot.as_deref().is_none_or(|v| v.trim().is_empty()) {
        *slot = Some(default.to_string());
    }
}

fn fill_num(slot: &mut Option<u32>, default: u32) {
    if slot.is_none_or(|v| v == 0) {
        *slot = Some(default);
    }
}

impl RhpamEnvironmentSpec {
    /// Returns a copy of the spec with every unset override replaced by the
    /// operator default. The stored resource is never rewritten.
    #[must_use]
    pub fn with_defaults(&self) -> Self {
        let mut spec = self.clone();

        let db = &mut spec.config.database;
        fill(&mut db.persistent_volume_capacity, "1Gi");
        fill_num(&mut db.max_connections, 100);
        fill(&mut db.shared_buffers, "32MB");
        fill_num(&mut db.max_prepared_transactions, 100);
        fill(&mut db.memory_limit, "512Mi");

        let bc = &mut spec.config.business_central;
        fill(&mut bc.persistent_volume_capacity, "1Gi");
        fill(&mut bc.cpu_request, "200m");
        fill(&mut bc.cpu_limit, "2");
        fill(&mut bc.memory_request, "1Gi");
        fill(&mut bc.memory_limit, "2Gi");
        fill_num(&mut bc.gc_max_meta_size, 500);
        fill(&mut bc.kie_mbeans, "enabled");
        if bc.java_opts_append.is_none() {
            bc.java_opts_append = Some(String::new());
        }

        let ks = &mut spec.config.kie_server;
        fill(&mut ks.cpu_request, "200m");
        fill(&mut ks.cpu_limit, "1");
        fill(&mut ks.memory_request, "1Gi");
        fill(&mut ks.memory_limit, "2Gi");
        fill_num(&mut ks.gc_max_meta_size, 500);
        fill(&mut ks.kie_mbeans, "enabled");
        fill(&mut ks.kie_server_id, "rhpam-kieserver");
        ks.filter_classes.get_or_insert(true);
        ks.bypass_auth_user.get_or_insert(false);

        spec
    }

    /// Basic sanity checks on a defaulted spec.
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        let domain = self.domain.trim();
        if domain.is_empty() {
            return Err(SpecValidationError::EmptyDomain);
        }
        if !is_dns_name(domain) {
            return Err(SpecValidationError::InvalidDomain(self.domain.clone()));
        }

        let db = &self.config.database;
        if db.max_connections == Some(0) {
            return Err(SpecValidationError::Zero { field: "config.database.maxConnections" });
        }
        if db.max_prepared_transactions == Some(0) {
            return Err(SpecValidationError::Zero {
                field: "config.database.maxPreparedTransactions",
            });
        }

        check_toggle(
            "config.businessCentral.kieMbeans",
            self.config.business_central.kie_mbeans.as_deref(),
        )?;
        check_toggle("config.kieServer.kieMbeans", self.config.kie_server.kie_mbeans.as_deref())?;
        Ok(())
    }
}

fn check_toggle(field: &'static str, value: Option<&str>) -> Result<(), SpecValidationError> {
    match value {
        None | Some("enabled" | "disabled") => Ok(()),
        Some(other) => Err(SpecValidationError::InvalidToggle {
            field,
            value: other.to_string(),
        }),
    }
}

fn is_dns_name(domain: &str) -> bool {
    domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RhpamEnvironmentStatus {
    /// Provisioning phase
    #[serde(default)]
    pub phase: EnvironmentPhase,

    /// Product version marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// SSO realm created for this environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    /// When `phase` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Provisioning phase of an [`RhpamEnvironment`]
///
/// Serializes as PascalCase ("RealmProvisioned", "DatabaseReady", etc.) but
/// also accepts the lowercase, space separated names written by earlier
/// releases of the operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub enum EnvironmentPhase {
    /// Freshly created, not yet looked at
    #[default]
    #[serde(rename = "")]
    NoPhase,

    #[serde(alias = "accepted")]
    Accepted,

    #[serde(alias = "realm provisioned")]
    RealmProvisioned,

    /// Legacy entry point equivalent to `RealmProvisioned`
    #[serde(alias = "prepare provisioning")]
    Prepare,

    #[serde(alias = "prepared")]
    Prepared,

    #[serde(alias = "database installed")]
    DatabaseInstalled,

    #[serde(alias = "business central installed")]
    BusinessCentralInstalled,

    #[serde(alias = "database ready")]
    DatabaseReady,

    #[serde(alias = "complete")]
    Complete,

    #[serde(alias = "deprovisioned")]
    Deprovisioned,

    #[serde(alias = "deprovision failed")]
    DeprovisionFailed,
}

impl EnvironmentPhase {
    /// The serialized name of the phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoPhase => "",
            Self::Accepted => "Accepted",
            Self::RealmProvisioned => "RealmProvisioned",
            Self::Prepare => "Prepare",
            Self::Prepared => "Prepared",
            Self::DatabaseInstalled => "DatabaseInstalled",
            Self::BusinessCentralInstalled => "BusinessCentralInstalled",
            Self::DatabaseReady => "DatabaseReady",
            Self::Complete => "Complete",
            Self::Deprovisioned => "Deprovisioned",
            Self::DeprovisionFailed => "DeprovisionFailed",
        }
    }
}

impl fmt::Display for EnvironmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPhase => f.write_str("NoPhase"),
            other => f.write_str(other.as_str()),
        }
    }
}
