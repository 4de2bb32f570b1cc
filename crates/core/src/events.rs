use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OpportunityId, OutcomeId, Platform};

/// Why a cycle ended before placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    /// The opportunity was cancelled before this agent got going.
    Cancelled,
    /// The partner never became ready in time.
    PartnerTimeout,
    /// The partner had already timed out and left when this agent became ready.
    PartnerGone,
    /// The leg could not be constructed for this platform.
    Rejected(String),
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::PartnerTimeout => write!(f, "partner timeout"),
            Self::PartnerGone => write!(f, "partner gone"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Terminal result of one agent's cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Both legs placed.
    Hedged,
    /// This leg was placed, the partner's was not, and the bet was unwound.
    RolledBack,
    /// This leg was placed, the partner's was not, and the unwind failed.
    /// The position is open and unhedged.
    RollbackFailed,
    /// This leg did not land.
    Failed(String),
    /// The cycle stopped before placement.
    Abandoned(AbandonReason),
}

impl CycleOutcome {
    /// Returns true for the only outcome that leaves an unhedged position.
    #[must_use]
    pub fn has_exposure(&self) -> bool {
        matches!(self, Self::RollbackFailed)
    }

    /// Returns true if the cycle counts against the failure streak.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Hedged)
    }
}

/// Structured completion record for one leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegResult {
    pub platform: Platform,
    pub opportunity_id: OpportunityId,
    pub outcome: CycleOutcome,
    pub bet_ref: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl LegResult {
    #[must_use]
    pub fn new(
        platform: Platform,
        opportunity_id: OpportunityId,
        outcome: CycleOutcome,
        bet_ref: Option<String>,
    ) -> Self {
        Self {
            platform,
            opportunity_id,
            outcome,
            bet_ref,
            completed_at: Utc::now(),
        }
    }
}

/// Severity of an operator escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

/// Something a human operator needs to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub severity: Severity,
    pub opportunity_id: OpportunityId,
    pub platform: Platform,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    #[must_use]
    pub fn warning(opportunity_id: &OpportunityId, platform: &Platform, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, opportunity_id, platform, message)
    }

    #[must_use]
    pub fn critical(opportunity_id: &OpportunityId, platform: &Platform, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, opportunity_id, platform, message)
    }

    fn new(
        severity: Severity,
        opportunity_id: &OpportunityId,
        platform: &Platform,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            opportunity_id: opportunity_id.clone(),
            platform: platform.clone(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Events broadcast by the execution layer. Fire-and-forget: no subscriber
/// can influence the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    /// An agent finished its cycle.
    LegCompleted(LegResult),

    /// An agent is unwinding its placed leg.
    RollbackRequested {
        opportunity_id: OpportunityId,
        platform: Platform,
        reason: String,
    },

    /// Operator attention required.
    Escalated(Escalation),

    /// A failed leg found a matching price again.
    RetryReady {
        opportunity_id: OpportunityId,
        platform: Platform,
        outcome_id: OutcomeId,
        odds: Decimal,
    },
}
