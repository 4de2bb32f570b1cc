//! Matching behaviour of the retry registry against a live odds feed.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use legsync_core::{
    ExecutionMetrics, Leg, LegHandle, LegQuote, LegStatus, OddsEvent, Opportunity, OpportunityId,
    OutcomeId, OutcomeOdds, Platform, RetryConfig,
};
use legsync_retry::RetryRegistry;

fn create_test_registry(max_attempts: u32) -> (RetryRegistry, Arc<ExecutionMetrics>) {
    let metrics = Arc::new(ExecutionMetrics::new());
    let config = RetryConfig {
        tolerance_pct: dec!(2),
        require_at_least_target: false,
        ttl: Duration::from_secs(300),
        max_attempts,
        ready_queue_capacity: 8,
    };
    (RetryRegistry::new(config, metrics.clone()), metrics)
}

fn create_failed_leg() -> (LegHandle, Arc<Opportunity>) {
    let opportunity = Arc::new(Opportunity {
        id: OpportunityId::new("opp-retry"),
        leg_a: LegQuote {
            platform: Platform::new("x"),
            outcome_id: OutcomeId::new("home"),
            odds: dec!(2.10),
            stake: dec!(45),
        },
        leg_b: LegQuote {
            platform: Platform::new("y"),
            outcome_id: OutcomeId::new("away"),
            odds: dec!(1.90),
            stake: dec!(50),
        },
        profit_pct: dec!(1.5),
        observed_at: Utc::now(),
        continuous: true,
    });
    let leg = LegHandle::new(Leg::from_quote(&opportunity.id, &opportunity.leg_b));
    leg.transition(LegStatus::Failed).unwrap();
    (leg, opportunity)
}

fn price(odds: Decimal) -> OddsEvent {
    OddsEvent::new(
        "match-42",
        Platform::new("y"),
        vec![
            OutcomeOdds {
                outcome_id: OutcomeId::new("draw"),
                odds: dec!(3.40),
            },
            OutcomeOdds {
                outcome_id: OutcomeId::new("away"),
                odds,
            },
        ],
    )
}

#[test]
fn target_price_matches_and_removes_spec() {
    let (registry, _) = create_test_registry(3);
    let y = Platform::new("y");
    let (leg, opportunity) = create_failed_leg();

    registry.register_failed_leg(leg.clone(), &y, opportunity).unwrap();
    assert_eq!(registry.on_fresh_odds(&price(dec!(1.90)), &y), 1);

    assert!(registry.spec(&y, &OutcomeId::new("away")).is_none());
    assert_eq!(leg.status(), LegStatus::Pending);

    let signal = registry.poll_ready_signal(&y).unwrap();
    assert_eq!(signal.odds, dec!(1.90));
    assert_eq!(signal.opportunity.leg_b.odds, dec!(1.90));
}

#[test]
fn price_outside_band_increments_attempts() {
    let (registry, _) = create_test_registry(3);
    let y = Platform::new("y");
    let away = OutcomeId::new("away");
    let (leg, opportunity) = create_failed_leg();

    registry.register_failed_leg(leg.clone(), &y, opportunity).unwrap();
    let original = registry.spec(&y, &away).unwrap();

    assert_eq!(registry.on_fresh_odds(&price(dec!(1.80)), &y), 0);

    let replaced = registry.spec(&y, &away).unwrap();
    assert_eq!(replaced.attempts, 1);
    assert_eq!(original.attempts, 0);
    assert!(!Arc::ptr_eq(&original, &replaced));
    assert_eq!(leg.status(), LegStatus::Failed);
    assert!(registry.poll_ready_signal(&y).is_none());
}

#[test]
fn spec_evicted_after_max_attempts() {
    let (registry, metrics) = create_test_registry(3);
    let y = Platform::new("y");
    let away = OutcomeId::new("away");
    let (leg, opportunity) = create_failed_leg();

    registry.register_failed_leg(leg, &y, opportunity).unwrap();

    registry.on_fresh_odds(&price(dec!(1.80)), &y);
    registry.on_fresh_odds(&price(dec!(1.80)), &y);
    assert_eq!(registry.spec(&y, &away).unwrap().attempts, 2);

    registry.on_fresh_odds(&price(dec!(1.80)), &y);
    assert!(registry.spec(&y, &away).is_none());
    assert_eq!(metrics.retries_evicted(), 1);

    // Nothing left to match even at the target price.
    assert_eq!(registry.on_fresh_odds(&price(dec!(1.90)), &y), 0);
}

#[tokio::test]
async fn concurrent_producers_match_once() {
    let (registry, metrics) = create_test_registry(100);
    let registry = Arc::new(registry);
    let y = Platform::new("y");
    let (leg, opportunity) = create_failed_leg();

    registry.register_failed_leg(leg, &y, opportunity).unwrap();

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let y = y.clone();
            tokio::spawn(async move { registry.on_fresh_odds(&price(dec!(1.90)), &y) })
        })
        .collect();

    let mut matched = 0;
    for producer in producers {
        matched += producer.await.unwrap();
    }

    assert_eq!(matched, 1);
    assert_eq!(metrics.retries_matched(), 1);
    assert!(registry.poll_ready_signal(&y).is_some());
    assert!(registry.poll_ready_signal(&y).is_none());
}
