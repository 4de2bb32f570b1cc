//! Opportunity dispatch.
//!
//! Polls the opportunity source, turns each acceptable opportunity into one
//! [`LegTask`] per platform and pushes both onto the platform queues. An
//! opportunity stays active from dispatch until its completion barrier
//! releases; while active it is never dispatched again. A cycle that outlives
//! the cycle timeout is logged but keeps its opportunity active.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use legsync_core::{Counter, DispatchConfig, ExecutionMetrics, Opportunity, OpportunityId, OpportunitySource};
use legsync_execution::{DispatchQueues, ExecutionError, LegTask, RetryPolicy};
use legsync_retry::ReadySignal;
use legsync_sync::BarrierWait;

use crate::breaker::{BreakerError, ExposureBreaker};

/// Why an opportunity was not dispatched.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Opportunity {0} is already active")]
    AlreadyActive(OpportunityId),

    #[error("Opportunity {opportunity} is {age_ms}ms old")]
    Stale { opportunity: OpportunityId, age_ms: u128 },

    #[error("Opportunity {0} is below the profit threshold")]
    BelowThreshold(OpportunityId),

    #[error("Opportunity {0} has gaps in its price stream")]
    Discontinuous(OpportunityId),

    #[error("Breaker blocks dispatch: {0}")]
    Blocked(#[from] BreakerError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

pub struct OpportunityDispatcher {
    source: Arc<dyn OpportunitySource>,
    queues: Arc<DispatchQueues>,
    breaker: Arc<ExposureBreaker>,
    metrics: Arc<ExecutionMetrics>,
    config: DispatchConfig,
    cycle_timeout: Duration,
    active: Mutex<HashSet<OpportunityId>>,
    settled: Notify,
}

impl OpportunityDispatcher {
    #[must_use]
    pub fn new(
        source: Arc<dyn OpportunitySource>,
        queues: Arc<DispatchQueues>,
        breaker: Arc<ExposureBreaker>,
        metrics: Arc<ExecutionMetrics>,
        config: DispatchConfig,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            source,
            queues,
            breaker,
            metrics,
            config,
            cycle_timeout,
            active: Mutex::new(HashSet::new()),
            settled: Notify::new(),
        }
    }

    /// Fetches once and dispatches everything acceptable. Returns how many
    /// opportunities were dispatched.
    ///
    /// # Errors
    /// Returns an error only if the source itself fails.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        if let Err(e) = self.breaker.can_dispatch() {
            debug!(reason = %e, "Dispatch skipped");
            return Ok(0);
        }

        let opportunities = self
            .source
            .fetch(self.config.min_profit_pct, self.config.max_age)
            .await
            .context("Opportunity source failed")?;

        let mut dispatched = 0;
        for opportunity in opportunities {
            let id = opportunity.id.clone();
            match self.dispatch_fresh(Arc::new(opportunity)) {
                Ok(()) => dispatched += 1,
                Err(DispatchError::AlreadyActive(_)) => {
                    debug!(opportunity = %id, "Opportunity already active");
                }
                Err(e @ DispatchError::Blocked(_)) => {
                    warn!(opportunity = %id, reason = %e, "Dispatch halted mid-batch");
                    break;
                }
                Err(e) => {
                    warn!(opportunity = %id, reason = %e, "Opportunity skipped");
                }
            }
        }
        Ok(dispatched)
    }

    /// Applies the freshness filters, then dispatches with retries enabled.
    fn dispatch_fresh(self: &Arc<Self>, opportunity: Arc<Opportunity>) -> Result<(), DispatchError> {
        let age = opportunity.age(Utc::now());
        if age > self.config.max_age {
            return Err(DispatchError::Stale {
                opportunity: opportunity.id.clone(),
                age_ms: age.as_millis(),
            });
        }
        if opportunity.profit_pct < self.config.min_profit_pct {
            return Err(DispatchError::BelowThreshold(opportunity.id.clone()));
        }
        if self.config.require_continuity && !opportunity.continuous {
            return Err(DispatchError::Discontinuous(opportunity.id.clone()));
        }
        self.dispatch(opportunity, RetryPolicy::OnPriceMove)
    }

    /// Re-dispatches the opportunity behind a ready signal with the refreshed
    /// price. The new cycle never retries again.
    ///
    /// # Errors
    /// Fails if the opportunity is still active, the breaker is not closed, or
    /// the opportunity cannot be routed.
    pub fn redispatch(self: &Arc<Self>, signal: &ReadySignal) -> Result<(), DispatchError> {
        let refreshed = signal.opportunity.with_leg_odds(&signal.platform, signal.odds);
        info!(
            opportunity = %signal.opportunity_id,
            platform = %signal.platform,
            odds = %signal.odds,
            "Re-dispatching opportunity at refreshed price"
        );
        self.dispatch(Arc::new(refreshed), RetryPolicy::Never)
    }

    /// Builds both tasks and enqueues them.
    ///
    /// # Errors
    /// See [`DispatchError`].
    pub fn dispatch(self: &Arc<Self>, opportunity: Arc<Opportunity>, policy: RetryPolicy) -> Result<(), DispatchError> {
        self.breaker.can_dispatch()?;

        for platform in opportunity.platforms() {
            if !self.queues.has(platform) {
                return Err(ExecutionError::NoQueue(platform.clone()).into());
            }
        }
        let (first, second, completion) = LegTask::pair(opportunity.clone(), policy)?;

        let id = opportunity.id.clone();
        if !self.active.lock().insert(id.clone()) {
            return Err(DispatchError::AlreadyActive(id));
        }

        for task in [first, second] {
            if let Err(e) = self.queues.push(task) {
                // Never leave one leg queued alone.
                for platform in opportunity.platforms() {
                    if let Some(queue) = self.queues.get(platform) {
                        queue.drain_opportunity(&id);
                    }
                }
                self.active.lock().remove(&id);
                return Err(e.into());
            }
        }

        self.metrics.incr(Counter::OpportunitiesDispatched);
        info!(
            opportunity = %id,
            platform_a = %opportunity.leg_a.platform,
            platform_b = %opportunity.leg_b.platform,
            profit_pct = %opportunity.profit_pct,
            retry = ?policy,
            "Opportunity dispatched"
        );

        let dispatcher = Arc::clone(self);
        let cycle_timeout = self.cycle_timeout;
        tokio::spawn(async move {
            let mut overdue = 0u32;
            loop {
                match completion.wait(cycle_timeout).await {
                    BarrierWait::Released => {
                        debug!(opportunity = %id, "Opportunity completed");
                        break;
                    }
                    BarrierWait::Broken => {
                        warn!(opportunity = %id, "Opportunity completion barrier broken");
                        break;
                    }
                    BarrierWait::TimedOut => {
                        overdue += 1;
                        warn!(
                            opportunity = %id,
                            overdue_periods = overdue,
                            "Opportunity cycle exceeded its timeout, still waiting for both legs"
                        );
                    }
                }
            }
            dispatcher.active.lock().remove(&id);
            dispatcher.settled.notify_waiters();
        });

        Ok(())
    }

    /// Polls on the configured cadence until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(poll_ms = self.config.poll_interval.as_millis(), "Opportunity dispatcher started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Opportunity poll failed");
                    }
                }
            }
        }

        info!(active = self.active_count(), "Opportunity dispatcher stopped");
    }

    /// Waits until the opportunity is no longer active. Returns false if it
    /// is still active when `timeout` elapses.
    pub async fn wait_inactive(&self, opportunity_id: &OpportunityId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            // Register before checking so a removal in between is not missed.
            settled.as_mut().enable();

            if !self.is_active(opportunity_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                return !self.is_active(opportunity_id);
            }
        }
    }

    #[must_use]
    pub fn cycle_timeout(&self) -> Duration {
        self.cycle_timeout
    }

    #[must_use]
    pub fn is_active(&self, opportunity_id: &OpportunityId) -> bool {
        self.active.lock().contains(opportunity_id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
