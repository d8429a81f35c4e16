//! Allowed phase transitions.
//!
//! Each resource kind declares its forward transitions in one table. The
//! scheduler checks every status it is about to persist against it, so a
//! handler can neither skip nor regress a phase. Teardown phases are reachable
//! from anywhere, but only the deletion path produces them.

use crate::error::ControllerError;
use crds::{EnvironmentPhase, IdentityPhase};
use std::fmt::Display;

pub trait PhaseTable: Copy + Eq + Display + 'static {
    /// Resource kind used in errors and metrics
    const KIND: &'static str;

    /// `(from, to)` pairs of the forward path
    const TRANSITIONS: &'static [(Self, Self)];

    const DEPROVISIONED: Self;
    const DEPROVISION_FAILED: Self;

    fn is_teardown(self) -> bool {
        self == Self::DEPROVISIONED || self == Self::DEPROVISION_FAILED
    }

    /// Successor on the forward path
    fn next(self) -> Option<Self> {
        Self::TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, to)| *to)
    }
}

impl PhaseTable for EnvironmentPhase {
    const KIND: &'static str = "RhpamEnvironment";

    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::NoPhase, Self::Accepted),
        (Self::Accepted, Self::RealmProvisioned),
        (Self::RealmProvisioned, Self::Prepared),
        (Self::Prepare, Self::Prepared),
        (Self::Prepared, Self::DatabaseInstalled),
        (Self::DatabaseInstalled, Self::BusinessCentralInstalled),
        (Self::BusinessCentralInstalled, Self::DatabaseReady),
        (Self::DatabaseReady, Self::Complete),
        (Self::Complete, Self::Complete),
    ];

    const DEPROVISIONED: Self = Self::Deprovisioned;
    const DEPROVISION_FAILED: Self = Self::DeprovisionFailed;
}

impl PhaseTable for IdentityPhase {
    const KIND: &'static str = "RhpamIdentity";

    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::NoPhase, Self::Accepted),
        (Self::Accepted, Self::Reconcile),
        (Self::Reconcile, Self::Reconcile),
    ];

    const DEPROVISIONED: Self = Self::Deprovisioned;
    const DEPROVISION_FAILED: Self = Self::DeprovisionFailed;
}

/// Staying put is always allowed (a not-ready pass), as is entering teardown.
pub fn transition_allowed<P: PhaseTable>(from: P, to: P) -> bool {
    from == to || to.is_teardown() || P::TRANSITIONS.contains(&(from, to))
}

pub fn check_transition<P: PhaseTable>(from: P, to: P) -> Result<(), ControllerError> {
    if transition_allowed(from, to) {
        Ok(())
    } else {
        Err(ControllerError::IllegalTransition {
            kind: P::KIND,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
