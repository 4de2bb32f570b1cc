//! Retry specifications and the odds band they match against.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use legsync_core::{LegHandle, Opportunity, OutcomeId, Platform};

use crate::error::RetryError;

// =============================================================================
// Odds band
// =============================================================================

/// Acceptable range for a fresh price. `upper == None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OddsBand {
    pub lower: Decimal,
    pub upper: Option<Decimal>,
}

impl OddsBand {
    /// Builds the band around `target`.
    ///
    /// With `require_at_least_target` the band is `[T·(1−tol), ∞)`, otherwise
    /// `[T·(1−tol), T·(1+tol)]`. `tolerance_pct` is a percentage (2 = 2%).
    ///
    /// # Errors
    /// Returns `RetryError::InvalidTolerance` outside `[0, 100)` and
    /// `RetryError::InvalidTarget` for non-positive targets.
    pub fn from_tolerance(
        target: Decimal,
        tolerance_pct: Decimal,
        require_at_least_target: bool,
    ) -> Result<Self, RetryError> {
        if tolerance_pct < Decimal::ZERO || tolerance_pct >= Decimal::ONE_HUNDRED {
            return Err(RetryError::InvalidTolerance(tolerance_pct));
        }
        if target <= Decimal::ZERO {
            return Err(RetryError::InvalidTarget(target));
        }

        let tolerance = tolerance_pct / Decimal::ONE_HUNDRED;
        let lower = target * (Decimal::ONE - tolerance);
        let upper = (!require_at_least_target).then(|| target * (Decimal::ONE + tolerance));
        Ok(Self { lower, upper })
    }

    /// Returns true if `odds` falls inside the band (inclusive).
    #[must_use]
    pub fn contains(&self, odds: Decimal) -> bool {
        odds >= self.lower && self.upper.map_or(true, |upper| odds <= upper)
    }
}

impl std::fmt::Display for OddsBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.upper {
            Some(upper) => write!(f, "[{}, {}]", self.lower, upper),
            None => write!(f, "[{}, inf)", self.lower),
        }
    }
}

// =============================================================================
// Retry specification
// =============================================================================

/// A pending retry for one failed leg.
///
/// Specs are immutable once stored: a non-matching update replaces the stored
/// `Arc` with [`RetrySpec::with_incremented_attempt`], it never edits it.
#[derive(Debug, Clone)]
pub struct RetrySpec {
    pub outcome_id: OutcomeId,
    pub platform: Platform,
    pub target_odds: Decimal,
    pub band: OddsBand,
    pub registered_at: DateTime<Utc>,
    created: Instant,
    pub ttl: Duration,
    pub attempts: u32,
    pub max_attempts: u32,
    pub leg: LegHandle,
    pub opportunity: Arc<Opportunity>,
}

impl RetrySpec {
    /// Builds a fresh spec with zero attempts.
    #[must_use]
    pub fn new(
        leg: LegHandle,
        opportunity: Arc<Opportunity>,
        band: OddsBand,
        ttl: Duration,
        max_attempts: u32,
    ) -> Self {
        let snapshot = leg.snapshot();
        Self {
            outcome_id: snapshot.outcome_id,
            platform: snapshot.platform,
            target_odds: snapshot.odds,
            band,
            registered_at: Utc::now(),
            created: Instant::now(),
            ttl,
            attempts: 0,
            max_attempts,
            leg,
            opportunity,
        }
    }

    /// Copy with one more recorded attempt; creation time is preserved so the
    /// TTL keeps counting from the original failure.
    #[must_use]
    pub fn with_incremented_attempt(&self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.age() >= self.ttl
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    #[must_use]
    pub fn matches(&self, odds: Decimal) -> bool {
        self.band.contains(odds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legsync_core::{Leg, LegQuote, OpportunityId};
    use rust_decimal_macros::dec;

    fn create_test_spec(max_attempts: u32) -> RetrySpec {
        let opportunity = Opportunity {
            id: OpportunityId::new("opp-1"),
            leg_a: LegQuote {
                platform: Platform::new("x"),
                outcome_id: OutcomeId::new("home"),
                odds: dec!(2.10),
                stake: dec!(50),
            },
            leg_b: LegQuote {
                platform: Platform::new("y"),
                outcome_id: OutcomeId::new("away"),
                odds: dec!(1.90),
                stake: dec!(55),
            },
            profit_pct: dec!(2),
            observed_at: Utc::now(),
            continuous: true,
        };
        let leg = LegHandle::new(Leg::from_quote(&opportunity.id, &opportunity.leg_b));
        let band = OddsBand::from_tolerance(dec!(1.90), dec!(2), false).unwrap();
        RetrySpec::new(leg, Arc::new(opportunity), band, Duration::from_secs(60), max_attempts)
    }

    #[test]
    fn test_symmetric_band() {
        let band = OddsBand::from_tolerance(dec!(1.90), dec!(2), false).unwrap();

        assert_eq!(band.lower, dec!(1.862));
        assert_eq!(band.upper, Some(dec!(1.938)));
        assert!(band.contains(dec!(1.90)));
        assert!(band.contains(dec!(1.862)));
        assert!(band.contains(dec!(1.938)));
        assert!(!band.contains(dec!(1.80)));
        assert!(!band.contains(dec!(1.95)));
    }

    #[test]
    fn test_at_least_target_band_is_unbounded_above() {
        let band = OddsBand::from_tolerance(dec!(1.90), dec!(2), true).unwrap();

        assert_eq!(band.upper, None);
        assert!(band.contains(dec!(5.00)));
        assert!(!band.contains(dec!(1.85)));
        assert!(band.to_string().ends_with(", inf)"));
    }

    #[test]
    fn test_band_rejects_bad_inputs() {
        assert!(matches!(
            OddsBand::from_tolerance(dec!(1.90), dec!(-1), false),
            Err(RetryError::InvalidTolerance(_))
        ));
        assert!(matches!(
            OddsBand::from_tolerance(dec!(1.90), dec!(100), false),
            Err(RetryError::InvalidTolerance(_))
        ));
        assert!(matches!(
            OddsBand::from_tolerance(Decimal::ZERO, dec!(2), false),
            Err(RetryError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_increment_replaces_without_touching_original() {
        let spec = create_test_spec(3);
        let next = spec.with_incremented_attempt();

        assert_eq!(spec.attempts, 0);
        assert_eq!(next.attempts, 1);
        assert_eq!(next.target_odds, dec!(1.90));
        assert_eq!(next.outcome_id, OutcomeId::new("away"));
        assert!(!next.is_exhausted());
        assert!(next.with_incremented_attempt().with_incremented_attempt().is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_follows_original_creation() {
        let spec = create_test_spec(3);
        tokio::time::advance(Duration::from_secs(30)).await;
        let next = spec.with_incremented_attempt();
        assert!(!next.is_expired());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(next.is_expired());
        assert!(spec.is_expired());
    }
}
