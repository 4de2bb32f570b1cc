//! The immutable envelope a platform worker receives for one opportunity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use legsync_core::{LegQuote, Opportunity, OpportunityId, Platform};
use legsync_sync::Barrier;

use crate::error::ExecutionError;

/// What the driver may do when a placement is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Register price-moved rejections with the retry registry.
    OnPriceMove,
    /// Never retry. Used for cycles that are themselves a retry.
    Never,
}

impl RetryPolicy {
    #[must_use]
    pub fn retries_price_moves(self) -> bool {
        matches!(self, Self::OnPriceMove)
    }
}

/// One agent's share of an opportunity.
#[derive(Debug, Clone)]
pub struct LegTask {
    pub opportunity_id: OpportunityId,
    /// Two-sided snapshot taken at dispatch.
    pub opportunity: Arc<Opportunity>,
    /// Platform this task runs on.
    pub platform: Platform,
    /// The leg assigned to this agent.
    pub leg: LegQuote,
    pub retry_policy: RetryPolicy,
    /// Shared by both tasks of the opportunity; each arrives once when its
    /// cycle ends, however it ends.
    pub completion: Arc<Barrier>,
    pub dispatched_at: DateTime<Utc>,
}

impl LegTask {
    /// Builds the task for `platform`.
    ///
    /// # Errors
    /// Returns `ExecutionError::NoLeg` if `platform` does not participate.
    pub fn for_platform(
        opportunity: Arc<Opportunity>,
        platform: &Platform,
        retry_policy: RetryPolicy,
        completion: Arc<Barrier>,
    ) -> Result<Self, ExecutionError> {
        let leg = opportunity
            .leg_for(platform)
            .cloned()
            .ok_or_else(|| ExecutionError::NoLeg {
                opportunity: opportunity.id.clone(),
                platform: platform.clone(),
            })?;

        Ok(Self {
            opportunity_id: opportunity.id.clone(),
            platform: platform.clone(),
            leg,
            retry_policy,
            completion,
            dispatched_at: Utc::now(),
            opportunity,
        })
    }

    /// Builds both tasks of an opportunity around a fresh two-party
    /// completion barrier.
    ///
    /// # Errors
    /// Returns `ExecutionError::Core` if the opportunity is malformed.
    pub fn pair(
        opportunity: Arc<Opportunity>,
        retry_policy: RetryPolicy,
    ) -> Result<(Self, Self, Arc<Barrier>), ExecutionError> {
        opportunity.validate()?;
        let completion = Arc::new(Barrier::two_party());
        let [a, b] = opportunity.platforms();
        let (a, b) = (a.clone(), b.clone());

        let first = Self::for_platform(opportunity.clone(), &a, retry_policy, completion.clone())?;
        let second = Self::for_platform(opportunity, &b, retry_policy, completion.clone())?;
        Ok((first, second, completion))
    }

    /// Platform of the partner task.
    #[must_use]
    pub fn partner(&self) -> Option<&Platform> {
        self.opportunity.partner_of(&self.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legsync_core::OutcomeId;
    use rust_decimal_macros::dec;

    fn create_test_opportunity() -> Arc<Opportunity> {
        Arc::new(Opportunity {
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
                odds: dec!(1.95),
                stake: dec!(54),
            },
            profit_pct: dec!(2.5),
            observed_at: Utc::now(),
            continuous: true,
        })
    }

    #[test]
    fn test_pair_shares_completion_barrier() {
        let (first, second, completion) =
            LegTask::pair(create_test_opportunity(), RetryPolicy::OnPriceMove).unwrap();

        assert_eq!(first.platform, Platform::new("x"));
        assert_eq!(second.platform, Platform::new("y"));
        assert_eq!(first.leg.odds, dec!(2.10));
        assert_eq!(second.partner(), Some(&Platform::new("x")));
        assert!(Arc::ptr_eq(&first.completion, &completion));
        assert!(Arc::ptr_eq(&second.completion, &completion));
        assert_eq!(completion.parties(), 2);
    }

    #[test]
    fn test_task_for_foreign_platform_rejected() {
        let result = LegTask::for_platform(
            create_test_opportunity(),
            &Platform::new("z"),
            RetryPolicy::Never,
            Arc::new(Barrier::two_party()),
        );
        assert!(matches!(result, Err(ExecutionError::NoLeg { .. })));
    }

    #[test]
    fn test_pair_rejects_malformed_opportunity() {
        let mut opportunity = (*create_test_opportunity()).clone();
        opportunity.leg_b.platform = Platform::new("x");

        let result = LegTask::pair(Arc::new(opportunity), RetryPolicy::OnPriceMove);
        assert!(matches!(result, Err(ExecutionError::Core(_))));
    }
}
