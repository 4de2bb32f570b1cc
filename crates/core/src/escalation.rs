use parking_lot::Mutex;
use tracing::{error, warn};

use crate::events::{Escalation, Severity};
use crate::traits::EscalationSink;

/// Escalation sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEscalation;

impl EscalationSink for LogEscalation {
    fn escalate(&self, escalation: &Escalation) {
        match escalation.severity {
            Severity::Warning => warn!(
                opportunity = %escalation.opportunity_id,
                platform = %escalation.platform,
                "ESCALATION: {}",
                escalation.message
            ),
            Severity::Critical => error!(
                opportunity = %escalation.opportunity_id,
                platform = %escalation.platform,
                "ESCALATION (operator action required): {}",
                escalation.message
            ),
        }
    }
}

/// Escalation sink that keeps every alert, for inspection in tests and the
/// simulator.
#[derive(Debug, Default)]
pub struct RecordingEscalation {
    alerts: Mutex<Vec<Escalation>>,
}

impl RecordingEscalation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<Escalation> {
        self.alerts.lock().clone()
    }

    #[must_use]
    pub fn critical_count(&self) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.severity == Severity::Critical)
            .count()
    }
}

impl EscalationSink for RecordingEscalation {
    fn escalate(&self, escalation: &Escalation) {
        LogEscalation.escalate(escalation);
        self.alerts.lock().push(escalation.clone());
    }
}
