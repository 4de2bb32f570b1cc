use crate::events::Escalation;
use crate::types::{Leg, OddsEvent, Opportunity, OpportunityId, Platform};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

/// Result of asking a platform to accept a bet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Bet accepted under the given platform reference.
    Placed { bet_ref: String },
    /// Bet refused. `price_moved` marks refusals caused by a stale price,
    /// which are worth retrying when the price comes back.
    Rejected { reason: String, price_moved: bool },
}

impl Placement {
    #[must_use]
    pub fn placed(bet_ref: impl Into<String>) -> Self {
        Self::Placed {
            bet_ref: bet_ref.into(),
        }
    }

    #[must_use]
    pub fn price_moved(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            price_moved: true,
        }
    }

    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            price_moved: false,
        }
    }
}

/// Per-platform bet execution: navigation, placement and cash-out.
///
/// Every call may be slow and may fail; the execution driver treats an `Err`
/// exactly like a negative answer.
#[async_trait]
pub trait BetExecutionAdapter: Send + Sync {
    /// Platform this adapter drives.
    fn platform(&self) -> &Platform;

    /// Brings the bet slip to a state where `place` can be called.
    async fn acquire_position(&self, leg: &Leg) -> Result<bool>;

    /// Submits the bet.
    async fn place(&self, leg: &Leg) -> Result<Placement>;

    /// Cancels or cashes out a previously placed bet.
    async fn rollback(&self, bet_ref: &str, leg: &Leg) -> Result<bool>;

    /// Clears any half-filled slip left behind by an aborted cycle.
    async fn clear_pending(&self, _leg: &Leg) -> Result<()> {
        Ok(())
    }
}

/// Source of freshly detected opportunities.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn fetch(&self, min_profit_pct: Decimal, max_age: Duration) -> Result<Vec<Opportunity>>;
}

/// Live odds feed for one platform.
#[async_trait]
pub trait OddsStream: Send {
    /// Returns the next update, or `None` once the stream is exhausted.
    async fn next_event(&mut self) -> Result<Option<OddsEvent>>;
}

/// Persistence of leg status transitions.
#[async_trait]
pub trait LegStore: Send + Sync {
    async fn save(&self, leg: &Leg) -> Result<()>;
    async fn load(&self, opportunity_id: &OpportunityId, platform: &Platform) -> Result<Option<Leg>>;
}

/// Destination for operator alerts.
pub trait EscalationSink: Send + Sync {
    fn escalate(&self, escalation: &Escalation);
}
