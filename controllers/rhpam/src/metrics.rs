//! Prometheus counters for reconciliation passes.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    phase_transitions: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let reconciliations = IntCounterVec::new(
            Opts::new("rhpam_reconciliations_total", "Reconciliation passes by resource kind and outcome"),
            &["kind", "outcome"],
        )?;
        let phase_transitions = IntCounterVec::new(
            Opts::new("rhpam_phase_transitions_total", "Phases entered by resource kind"),
            &["kind", "phase"],
        )?;
        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(phase_transitions.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            phase_transitions,
        })
    }

    pub fn record_reconciliation(&self, kind: &str, outcome: &str) {
        self.reconciliations.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_transition(&self, kind: &str, phase: &str) {
        self.phase_transitions.with_label_values(&[kind, phase]).inc();
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub fn reconciliation_count(&self, kind: &str, outcome: &str) -> u64 {
        self.reconciliations.with_label_values(&[kind, outcome]).get()
    }

    #[cfg(test)]
    pub fn transition_count(&self, kind: &str, phase: &str) -> u64 {
        self.phase_transitions.with_label_values(&[kind, phase]).get()
    }
}
