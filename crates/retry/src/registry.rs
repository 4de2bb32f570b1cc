//! Per-platform retry registry.
//!
//! Many producers (the odds ingest workers) call [`RetryRegistry::on_fresh_odds`];
//! one consumer per platform drains that platform's ready queue. A spec is
//! removed from the map under the map lock before it is acted on, so no spec
//! can match twice.

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use legsync_core::{
    Counter, ExecutionMetrics, LegHandle, LegStatus, OddsEvent, Opportunity, OpportunityId, OutcomeId,
    Platform, RetryConfig,
};

use crate::error::RetryError;
use crate::spec::{OddsBand, RetrySpec};

/// Emitted when a failed leg's price is acceptable again.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    pub platform: Platform,
    pub outcome_id: OutcomeId,
    pub opportunity_id: OpportunityId,
    /// The fresh price that matched.
    pub odds: Decimal,
    pub leg: LegHandle,
    /// The opportunity as it was when the leg failed.
    pub opportunity: Arc<Opportunity>,
}

enum Decision {
    Matched(Arc<RetrySpec>),
    Retry(u32),
    Evict(&'static str),
}

struct PlatformRetries {
    specs: Mutex<HashMap<OutcomeId, Arc<RetrySpec>>>,
    ready_tx: mpsc::Sender<ReadySignal>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<ReadySignal>>,
}

impl PlatformRetries {
    fn new(capacity: usize) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(capacity.max(1));
        Self {
            specs: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
        }
    }
}

/// Matches live odds against failed legs and emits ready signals.
pub struct RetryRegistry {
    config: RetryConfig,
    platforms: RwLock<HashMap<Platform, Arc<PlatformRetries>>>,
    metrics: Arc<ExecutionMetrics>,
}

impl std::fmt::Debug for RetryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryRegistry")
            .field("config", &self.config)
            .field("platforms", &self.platforms.read().len())
            .finish()
    }
}

impl RetryRegistry {
    #[must_use]
    pub fn new(config: RetryConfig, metrics: Arc<ExecutionMetrics>) -> Self {
        Self {
            config,
            platforms: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn platform(&self, platform: &Platform) -> Arc<PlatformRetries> {
        if let Some(retries) = self.platforms.read().get(platform) {
            return retries.clone();
        }
        self.platforms
            .write()
            .entry(platform.clone())
            .or_insert_with(|| Arc::new(PlatformRetries::new(self.config.ready_queue_capacity)))
            .clone()
    }

    /// Stores a retry spec for a failed leg, keyed by (platform, outcome).
    ///
    /// A spec already pending for the same outcome is replaced.
    ///
    /// # Errors
    /// Returns `RetryError::LegNotFailed` unless the leg is `Failed`, or a band
    /// error if its odds cannot form a band.
    pub fn register_failed_leg(
        &self,
        leg: LegHandle,
        platform: &Platform,
        opportunity: Arc<Opportunity>,
    ) -> Result<(), RetryError> {
        let snapshot = leg.snapshot();
        if snapshot.status != LegStatus::Failed {
            return Err(RetryError::LegNotFailed(snapshot.status));
        }

        let band = OddsBand::from_tolerance(
            snapshot.odds,
            self.config.tolerance_pct,
            self.config.require_at_least_target,
        )?;
        let spec = RetrySpec::new(leg, opportunity, band, self.config.ttl, self.config.max_attempts);

        let replaced = self
            .platform(platform)
            .specs
            .lock()
            .insert(snapshot.outcome_id.clone(), Arc::new(spec))
            .is_some();
        self.metrics.incr(Counter::RetriesRegistered);

        info!(
            opportunity = %snapshot.opportunity_id,
            platform = %platform,
            outcome = %snapshot.outcome_id,
            target = %snapshot.odds,
            band = %band,
            replaced,
            "Registered failed leg for retry"
        );
        Ok(())
    }

    /// Evaluates every priced outcome in `event` against pending specs on
    /// `platform`. Returns how many specs matched.
    pub fn on_fresh_odds(&self, event: &OddsEvent, platform: &Platform) -> usize {
        let Some(retries) = self.platforms.read().get(platform).cloned() else {
            return 0;
        };

        let mut matched = 0;
        for quote in &event.outcomes {
            let decision = {
                let mut specs = retries.specs.lock();
                let Some(spec) = specs.get(&quote.outcome_id).cloned() else {
                    continue;
                };

                if spec.is_expired() {
                    specs.remove(&quote.outcome_id);
                    Decision::Evict("ttl expired")
                } else if spec.matches(quote.odds) {
                    specs.remove(&quote.outcome_id);
                    Decision::Matched(spec)
                } else {
                    let next = spec.with_incremented_attempt();
                    if next.is_exhausted() {
                        specs.remove(&quote.outcome_id);
                        Decision::Evict("max attempts reached")
                    } else {
                        let attempts = next.attempts;
                        specs.insert(quote.outcome_id.clone(), Arc::new(next));
                        Decision::Retry(attempts)
                    }
                }
            };

            match decision {
                Decision::Matched(spec) => {
                    matched += 1;
                    self.fire(&retries, &spec, quote.odds);
                }
                Decision::Retry(attempts) => {
                    debug!(
                        platform = %platform,
                        outcome = %quote.outcome_id,
                        odds = %quote.odds,
                        attempts,
                        "Fresh odds outside retry band"
                    );
                }
                Decision::Evict(reason) => {
                    self.metrics.incr(Counter::RetriesEvicted);
                    info!(
                        platform = %platform,
                        outcome = %quote.outcome_id,
                        reason,
                        "Retry spec evicted"
                    );
                }
            }
        }
        matched
    }

    fn fire(&self, retries: &PlatformRetries, spec: &RetrySpec, odds: Decimal) {
        let rearmed = spec.leg.update(|leg| {
            leg.odds = odds;
            leg.status == LegStatus::Failed && leg.transition(LegStatus::Pending).is_ok()
        });
        self.metrics.incr(Counter::RetriesMatched);

        let signal = ReadySignal {
            platform: spec.platform.clone(),
            outcome_id: spec.outcome_id.clone(),
            opportunity_id: spec.opportunity.id.clone(),
            odds,
            leg: spec.leg.clone(),
            opportunity: spec.opportunity.clone(),
        };

        match retries.ready_tx.try_send(signal) {
            Ok(()) => info!(
                opportunity = %spec.opportunity.id,
                platform = %spec.platform,
                outcome = %spec.outcome_id,
                target = %spec.target_odds,
                odds = %odds,
                rearmed,
                "Retry matched, leg ready"
            ),
            Err(TrySendError::Full(signal)) => {
                self.metrics.incr(Counter::ReadySignalsDropped);
                warn!(
                    opportunity = %signal.opportunity_id,
                    platform = %signal.platform,
                    outcome = %signal.outcome_id,
                    "Ready queue full, dropping signal"
                );
            }
            Err(TrySendError::Closed(signal)) => {
                self.metrics.incr(Counter::ReadySignalsDropped);
                warn!(
                    opportunity = %signal.opportunity_id,
                    platform = %signal.platform,
                    "Ready queue closed, dropping signal"
                );
            }
        }
    }

    /// Waits up to `timeout` for the next ready signal on `platform`.
    pub async fn next_ready_signal(&self, platform: &Platform, timeout: Duration) -> Option<ReadySignal> {
        let retries = self.platform(platform);
        tokio::time::timeout(timeout, async {
            let mut rx = retries.ready_rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten()
    }

    /// Takes a ready signal for `platform` without waiting.
    pub fn poll_ready_signal(&self, platform: &Platform) -> Option<ReadySignal> {
        let retries = self.platforms.read().get(platform).cloned()?;
        let mut rx = retries.ready_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Drops every spec whose TTL elapsed. Returns the number evicted.
    pub fn sweep_expired(&self) -> usize {
        let platforms: Vec<(Platform, Arc<PlatformRetries>)> = self
            .platforms
            .read()
            .iter()
            .map(|(platform, retries)| (platform.clone(), retries.clone()))
            .collect();

        let mut evicted = 0;
        for (platform, retries) in platforms {
            let mut specs = retries.specs.lock();
            let before = specs.len();
            specs.retain(|_, spec| !spec.is_expired());
            let removed = before - specs.len();
            drop(specs);

            if removed > 0 {
                info!(platform = %platform, removed, "Swept expired retry specs");
                evicted += removed;
            }
        }
        self.metrics.add(Counter::RetriesEvicted, evicted as u64);
        evicted
    }

    /// Current spec for an outcome, if one is pending.
    #[must_use]
    pub fn spec(&self, platform: &Platform, outcome_id: &OutcomeId) -> Option<Arc<RetrySpec>> {
        self.platforms
            .read()
            .get(platform)
            .and_then(|retries| retries.specs.lock().get(outcome_id).cloned())
    }

    /// Number of specs pending on `platform`.
    #[must_use]
    pub fn pending(&self, platform: &Platform) -> usize {
        self.platforms
            .read()
            .get(platform)
            .map_or(0, |retries| retries.specs.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use legsync_core::{Leg, LegQuote, OutcomeOdds};
    use rust_decimal_macros::dec;

    fn create_test_config(max_attempts: u32, capacity: usize) -> RetryConfig {
        RetryConfig {
            tolerance_pct: dec!(2),
            require_at_least_target: false,
            ttl: Duration::from_secs(60),
            max_attempts,
            ready_queue_capacity: capacity,
        }
    }

    fn create_test_opportunity(id: &str) -> Arc<Opportunity> {
        Arc::new(Opportunity {
            id: OpportunityId::new(id),
            leg_a: LegQuote {
                platform: Platform::new("x"),
                outcome_id: OutcomeId::new(format!("{id}-home")),
                odds: dec!(2.10),
                stake: dec!(50),
            },
            leg_b: LegQuote {
                platform: Platform::new("y"),
                outcome_id: OutcomeId::new(format!("{id}-away")),
                odds: dec!(1.90),
                stake: dec!(55),
            },
            profit_pct: dec!(2),
            observed_at: Utc::now(),
            continuous: true,
        })
    }

    fn failed_leg(opportunity: &Opportunity) -> LegHandle {
        let leg = LegHandle::new(Leg::from_quote(&opportunity.id, &opportunity.leg_b));
        leg.transition(LegStatus::Failed).unwrap();
        leg
    }

    fn odds(outcome: &OutcomeId, price: Decimal) -> OddsEvent {
        OddsEvent::new(
            "event-1",
            Platform::new("y"),
            vec![OutcomeOdds {
                outcome_id: outcome.clone(),
                odds: price,
            }],
        )
    }

    fn registry(max_attempts: u32, capacity: usize) -> (RetryRegistry, Arc<ExecutionMetrics>) {
        let metrics = Arc::new(ExecutionMetrics::new());
        (
            RetryRegistry::new(create_test_config(max_attempts, capacity), metrics.clone()),
            metrics,
        )
    }

    #[test]
    fn test_register_requires_failed_leg() {
        let (registry, _) = registry(3, 4);
        let opp = create_test_opportunity("opp-1");
        let leg = LegHandle::new(Leg::from_quote(&opp.id, &opp.leg_b));

        let err = registry
            .register_failed_leg(leg, &Platform::new("y"), opp)
            .unwrap_err();
        assert_eq!(err, RetryError::LegNotFailed(LegStatus::Pending));
    }

    #[tokio::test]
    async fn test_match_rearms_leg_and_signals() {
        let (registry, metrics) = registry(3, 4);
        let y = Platform::new("y");
        let opp = create_test_opportunity("opp-1");
        let leg = failed_leg(&opp);
        let outcome = opp.leg_b.outcome_id.clone();

        registry.register_failed_leg(leg.clone(), &y, opp.clone()).unwrap();
        assert_eq!(registry.on_fresh_odds(&odds(&outcome, dec!(1.91)), &y), 1);

        assert_eq!(registry.pending(&y), 0);
        assert_eq!(leg.status(), LegStatus::Pending);
        assert_eq!(leg.snapshot().odds, dec!(1.91));

        let signal = registry
            .next_ready_signal(&y, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(signal.opportunity_id, opp.id);
        assert_eq!(signal.outcome_id, outcome);
        assert_eq!(signal.odds, dec!(1.91));
        assert_eq!(metrics.retries_matched(), 1);
    }

    #[test]
    fn test_spec_never_matches_twice() {
        let (registry, _) = registry(3, 4);
        let y = Platform::new("y");
        let opp = create_test_opportunity("opp-1");
        let outcome = opp.leg_b.outcome_id.clone();

        registry.register_failed_leg(failed_leg(&opp), &y, opp).unwrap();
        assert_eq!(registry.on_fresh_odds(&odds(&outcome, dec!(1.90)), &y), 1);
        assert_eq!(registry.on_fresh_odds(&odds(&outcome, dec!(1.90)), &y), 0);

        assert!(registry.poll_ready_signal(&y).is_some());
        assert!(registry.poll_ready_signal(&y).is_none());
    }

    #[test]
    fn test_other_platform_ignored() {
        let (registry, _) = registry(3, 4);
        let opp = create_test_opportunity("opp-1");
        let outcome = opp.leg_b.outcome_id.clone();

        registry
            .register_failed_leg(failed_leg(&opp), &Platform::new("y"), opp)
            .unwrap();
        assert_eq!(registry.on_fresh_odds(&odds(&outcome, dec!(1.90)), &Platform::new("x")), 0);
        assert_eq!(registry.pending(&Platform::new("y")), 1);
    }

    #[test]
    fn test_full_ready_queue_drops_signal() {
        let (registry, metrics) = registry(3, 1);
        let y = Platform::new("y");

        for id in ["opp-1", "opp-2"] {
            let opp = create_test_opportunity(id);
            let outcome = opp.leg_b.outcome_id.clone();
            registry.register_failed_leg(failed_leg(&opp), &y, opp).unwrap();
            assert_eq!(registry.on_fresh_odds(&odds(&outcome, dec!(1.90)), &y), 1);
        }

        assert_eq!(metrics.ready_signals_dropped(), 1);
        assert_eq!(
            registry.poll_ready_signal(&y).map(|s| s.opportunity_id),
            Some(OpportunityId::new("opp-1"))
        );
        assert!(registry.poll_ready_signal(&y).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_spec_evicted_on_next_update() {
        let (registry, metrics) = registry(3, 4);
        let y = Platform::new("y");
        let opp = create_test_opportunity("opp-1");
        let outcome = opp.leg_b.outcome_id.clone();

        registry.register_failed_leg(failed_leg(&opp), &y, opp).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(registry.on_fresh_odds(&odds(&outcome, dec!(1.90)), &y), 0);
        assert_eq!(registry.pending(&y), 0);
        assert_eq!(metrics.retries_evicted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let (registry, _) = registry(3, 4);
        let y = Platform::new("y");
        let opp = create_test_opportunity("opp-1");

        registry.register_failed_leg(failed_leg(&opp), &y, opp).unwrap();
        assert_eq!(registry.sweep_expired(), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(registry.sweep_expired(), 1);
        assert_eq!(registry.pending(&y), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_ready_signal_times_out() {
        let (registry, _) = registry(3, 4);
        let signal = registry
            .next_ready_signal(&Platform::new("y"), Duration::from_millis(50))
            .await;
        assert!(signal.is_none());
    }
}
