//! Shared domain types for two-leg execution.
//!
//! An [`Opportunity`] is the immutable snapshot handed out by the detection
//! layer. Each execution agent turns its half of it into a mutable [`Leg`],
//! which it owns for the duration of one cycle.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreError;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of a bookmaker platform (e.g. `"pinnacle"`).
    Platform
);

string_id!(
    /// Identity of a detected opportunity.
    OpportunityId
);

string_id!(
    /// Identity of a single priced outcome on a platform.
    OutcomeId
);

// =============================================================================
// Opportunity
// =============================================================================

/// One side of an opportunity as quoted by the detection layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegQuote {
    /// Platform the leg must be placed on.
    pub platform: Platform,
    /// Outcome the leg backs.
    pub outcome_id: OutcomeId,
    /// Decimal odds quoted at detection time.
    pub odds: Decimal,
    /// Stake to place.
    pub stake: Decimal,
}

/// A detected two-leg arbitrage opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Unique opportunity identifier.
    pub id: OpportunityId,
    /// First leg.
    pub leg_a: LegQuote,
    /// Second leg.
    pub leg_b: LegQuote,
    /// Estimated profit as a percentage of total stake.
    pub profit_pct: Decimal,
    /// When the prices backing this opportunity were last observed.
    pub observed_at: DateTime<Utc>,
    /// True if price updates arrived without gaps since detection.
    #[serde(default = "default_continuous")]
    pub continuous: bool,
}

const fn default_continuous() -> bool {
    true
}

impl Opportunity {
    /// Checks the structural invariants of an opportunity.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidOpportunity` if both legs share a platform,
    /// any odds are not above 1, or any stake is not positive.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.leg_a.platform == self.leg_b.platform {
            return Err(CoreError::invalid_opportunity(
                &self.id,
                format!("both legs on platform {}", self.leg_a.platform),
            ));
        }
        for leg in [&self.leg_a, &self.leg_b] {
            if leg.odds <= Decimal::ONE {
                return Err(CoreError::invalid_opportunity(
                    &self.id,
                    format!("odds {} on {} must exceed 1", leg.odds, leg.platform),
                ));
            }
            if leg.stake <= Decimal::ZERO {
                return Err(CoreError::invalid_opportunity(
                    &self.id,
                    format!("stake {} on {} must be positive", leg.stake, leg.platform),
                ));
            }
        }
        Ok(())
    }

    /// Returns both participating platforms.
    #[must_use]
    pub fn platforms(&self) -> [&Platform; 2] {
        [&self.leg_a.platform, &self.leg_b.platform]
    }

    /// Returns the leg bound to `platform`, if it participates.
    #[must_use]
    pub fn leg_for(&self, platform: &Platform) -> Option<&LegQuote> {
        if &self.leg_a.platform == platform {
            Some(&self.leg_a)
        } else if &self.leg_b.platform == platform {
            Some(&self.leg_b)
        } else {
            None
        }
    }

    /// Returns the platform of the partner leg.
    #[must_use]
    pub fn partner_of(&self, platform: &Platform) -> Option<&Platform> {
        if &self.leg_a.platform == platform {
            Some(&self.leg_b.platform)
        } else if &self.leg_b.platform == platform {
            Some(&self.leg_a.platform)
        } else {
            None
        }
    }

    /// Returns how old the backing prices are relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.observed_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns a copy with the leg on `platform` re-priced at `odds`.
    #[must_use]
    pub fn with_leg_odds(&self, platform: &Platform, odds: Decimal) -> Self {
        let mut refreshed = self.clone();
        if &refreshed.leg_a.platform == platform {
            refreshed.leg_a.odds = odds;
        } else if &refreshed.leg_b.platform == platform {
            refreshed.leg_b.odds = odds;
        }
        refreshed.observed_at = Utc::now();
        refreshed
    }
}

// =============================================================================
// Leg
// =============================================================================

/// Execution status of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegStatus {
    /// Not yet picked up, or re-armed by the retry registry.
    Pending,
    /// Intent registered with the coordinator.
    Intent,
    /// Position acquired and marked ready.
    Ready,
    /// Bet accepted by the platform.
    Placed,
    /// Leg did not land.
    Failed,
    /// Placed bet was compensated.
    RolledBack,
}

impl LegStatus {
    /// Returns true if `next` is a legal successor of this status.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Intent | Self::Failed)
                | (Self::Intent, Self::Ready | Self::Failed)
                | (Self::Ready, Self::Placed | Self::Failed)
                | (Self::Placed, Self::RolledBack)
                | (Self::Failed, Self::Pending)
        )
    }

    /// Returns the display string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Intent => "INTENT",
            Self::Ready => "READY",
            Self::Placed => "PLACED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

impl std::fmt::Display for LegStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The mutable leg owned by one execution agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    /// Opportunity this leg belongs to.
    pub opportunity_id: OpportunityId,
    /// Outcome the leg backs.
    pub outcome_id: OutcomeId,
    /// Platform the leg is placed on.
    pub platform: Platform,
    /// Current target odds.
    pub odds: Decimal,
    /// Stake.
    pub stake: Decimal,
    /// Current status.
    pub status: LegStatus,
    /// Platform-assigned bet reference, set once placed.
    pub bet_ref: Option<String>,
}

impl Leg {
    /// Creates a pending leg from a quote.
    #[must_use]
    pub fn from_quote(opportunity_id: &OpportunityId, quote: &LegQuote) -> Self {
        Self {
            opportunity_id: opportunity_id.clone(),
            outcome_id: quote.outcome_id.clone(),
            platform: quote.platform.clone(),
            odds: quote.odds,
            stake: quote.stake,
            status: LegStatus::Pending,
            bet_ref: None,
        }
    }

    /// Moves the leg to `next`.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidTransition` if the move breaks monotonicity.
    pub fn transition(&mut self, next: LegStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Records a successful placement.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidTransition` unless the leg is `Ready`.
    pub fn mark_placed(&mut self, bet_ref: impl Into<String>) -> Result<(), CoreError> {
        self.transition(LegStatus::Placed)?;
        self.bet_ref = Some(bet_ref.into());
        Ok(())
    }

    /// Potential return if the leg wins.
    #[must_use]
    pub fn payout(&self) -> Decimal {
        self.odds * self.stake
    }
}

/// Shared handle to a leg.
///
/// The owning driver is the primary writer; the retry registry may re-arm a
/// failed leg (FAILED → PENDING) and refresh its odds.
#[derive(Debug, Clone)]
pub struct LegHandle(Arc<RwLock<Leg>>);

impl LegHandle {
    /// Wraps a leg.
    #[must_use]
    pub fn new(leg: Leg) -> Self {
        Self(Arc::new(RwLock::new(leg)))
    }

    /// Returns a copy of the current leg state.
    #[must_use]
    pub fn snapshot(&self) -> Leg {
        self.0.read().clone()
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> LegStatus {
        self.0.read().status
    }

    /// Applies a status transition.
    ///
    /// # Errors
    /// Propagates `CoreError::InvalidTransition`.
    pub fn transition(&self, next: LegStatus) -> Result<(), CoreError> {
        self.0.write().transition(next)
    }

    /// Runs `f` with exclusive access to the leg.
    pub fn update<R>(&self, f: impl FnOnce(&mut Leg) -> R) -> R {
        f(&mut self.0.write())
    }
}

// =============================================================================
// Live odds
// =============================================================================

/// Fresh price for one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeOdds {
    /// Outcome identity.
    pub outcome_id: OutcomeId,
    /// Decimal odds.
    pub odds: Decimal,
}

/// A normalized live odds update from one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsEvent {
    /// Sporting event identifier.
    pub event_id: String,
    /// Platform that published the prices.
    pub platform: Platform,
    /// Priced outcomes.
    pub outcomes: Vec<OutcomeOdds>,
    /// When the update was received.
    pub received_at: DateTime<Utc>,
}

impl OddsEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_id: impl Into<String>, platform: Platform, outcomes: Vec<OutcomeOdds>) -> Self {
        Self {
            event_id: event_id.into(),
            platform,
            outcomes,
            received_at: Utc::now(),
        }
    }
}
