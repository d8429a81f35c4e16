//! RHPAM Operator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the RHPAM operator.

pub mod rhpam_environment;
pub mod rhpam_identity;

pub use rhpam_environment::*;
pub use rhpam_identity::*;
