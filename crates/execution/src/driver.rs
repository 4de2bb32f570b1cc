//! The per-platform execution driver.
//!
//! [`LegExecutionDriver::execute`] walks one [`LegTask`] through the
//! two-party protocol:
//!
//! 1. register intent (abort if the opportunity is already cancelled)
//! 2. acquire the position through the adapter
//! 3. mark ready (abandon if the partner already gave up)
//! 4. wait for both parties, draining the partner's queued task on timeout
//! 5. place, reporting the outcome before anything else
//! 6. resolve: a placed leg waits for its partner and rolls back if the
//!    partner did not land; a failed leg only observes
//!
//! Every exit path ends in the same cleanup: release intent, clear pending
//! adapter state, publish the result, arrive at the completion barrier.
//! [`CycleGuard`] performs the release and the arrival on drop, so a panic
//! inside a cycle cannot leak coordinator state or stall the dispatcher.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use legsync_core::{
    AbandonReason, BetExecutionAdapter, Counter, CycleOutcome, Escalation, EscalationSink,
    ExecutionConfig, ExecutionEvent, ExecutionMetrics, Leg, LegHandle, LegResult, LegStatus, LegStore,
    OpportunityId, Placement, Platform,
};
use legsync_retry::RetryRegistry;
use legsync_sync::{Barrier, PartnerOutcome, SyncCoordinator};

use crate::queue::DispatchQueues;
use crate::task::LegTask;

// =============================================================================
// Shared context
// =============================================================================

/// Collaborators shared by every platform's driver.
#[derive(Clone)]
pub struct ExecutionContext {
    pub config: ExecutionConfig,
    pub coordinator: Arc<SyncCoordinator>,
    pub retry: Arc<RetryRegistry>,
    pub queues: Arc<DispatchQueues>,
    pub store: Arc<dyn LegStore>,
    pub escalation: Arc<dyn EscalationSink>,
    pub events: broadcast::Sender<ExecutionEvent>,
    pub metrics: Arc<ExecutionMetrics>,
}

impl ExecutionContext {
    fn publish(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// =============================================================================
// Cycle guard
// =============================================================================

/// Releases intent and arrives at the completion barrier exactly once, even
/// if the cycle unwinds.
pub struct CycleGuard {
    coordinator: Arc<SyncCoordinator>,
    opportunity_id: OpportunityId,
    platform: Platform,
    completion: Arc<Barrier>,
    owns_intent: bool,
    released: bool,
    completed: bool,
}

impl CycleGuard {
    #[must_use]
    pub fn new(coordinator: Arc<SyncCoordinator>, task: &LegTask) -> Self {
        Self {
            coordinator,
            opportunity_id: task.opportunity_id.clone(),
            platform: task.platform.clone(),
            completion: task.completion.clone(),
            owns_intent: true,
            released: false,
            completed: false,
        }
    }

    /// Leaves the coordinator entry alone on exit. Used when another cycle of
    /// the same platform holds the intent for this opportunity.
    pub fn disown_intent(&mut self) {
        self.owns_intent = false;
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            if self.owns_intent {
                self.coordinator.release_intent(&self.opportunity_id, &self.platform);
            }
        }
    }

    pub fn complete(&mut self) {
        self.release();
        if !self.completed {
            self.completed = true;
            self.completion.arrive();
        }
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.completed {
            error!(
                opportunity = %self.opportunity_id,
                platform = %self.platform,
                panicking = std::thread::panicking(),
                "Cycle dropped before completing, releasing coordinator state"
            );
            self.complete();
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Drives one platform's legs through the protocol.
pub struct LegExecutionDriver {
    adapter: Arc<dyn BetExecutionAdapter>,
    ctx: ExecutionContext,
}

impl std::fmt::Debug for LegExecutionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegExecutionDriver")
            .field("platform", self.adapter.platform())
            .finish()
    }
}

impl LegExecutionDriver {
    #[must_use]
    pub fn new(adapter: Arc<dyn BetExecutionAdapter>, ctx: ExecutionContext) -> Self {
        Self { adapter, ctx }
    }

    #[must_use]
    pub fn platform(&self) -> &Platform {
        self.adapter.platform()
    }

    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Runs one full cycle. Never fails: every problem ends up in the
    /// returned [`LegResult`].
    pub async fn execute(&self, task: LegTask) -> LegResult {
        let mut guard = CycleGuard::new(self.ctx.coordinator.clone(), &task);
        self.ctx.metrics.incr(Counter::CyclesStarted);

        info!(
            opportunity = %task.opportunity_id,
            platform = %task.platform,
            outcome = %task.leg.outcome_id,
            odds = %task.leg.odds,
            stake = %task.leg.stake,
            "Starting leg cycle"
        );

        let leg = LegHandle::new(Leg::from_quote(&task.opportunity_id, &task.leg));
        let outcome = if self.register(&task, &mut guard) {
            self.run_protocol(&task, &leg).await
        } else {
            CycleOutcome::Abandoned(AbandonReason::Cancelled)
        };
        let bet_ref = leg.snapshot().bet_ref;

        guard.release();
        if let Err(e) = self.adapter.clear_pending(&leg.snapshot()).await {
            warn!(
                opportunity = %task.opportunity_id,
                platform = %task.platform,
                error = %e,
                "Failed to clear pending bet slip"
            );
        }

        let result = LegResult::new(task.platform.clone(), task.opportunity_id.clone(), outcome, bet_ref);
        self.record(&result);
        guard.complete();
        result
    }

    /// Step 1: intent. On refusal, disowns the guard's release if another
    /// cycle of this platform holds the intent.
    fn register(&self, task: &LegTask, guard: &mut CycleGuard) -> bool {
        let coordinator = &self.ctx.coordinator;
        if coordinator.register_intent(&task.opportunity_id, &task.platform, task.leg.odds) {
            return true;
        }
        if coordinator.holds_intent(&task.opportunity_id, &task.platform) {
            warn!(
                opportunity = %task.opportunity_id,
                platform = %task.platform,
                "Another cycle holds this intent, leaving its state alone"
            );
            guard.disown_intent();
        }
        false
    }

    async fn run_protocol(&self, task: &LegTask, leg: &LegHandle) -> CycleOutcome {
        let coordinator = &self.ctx.coordinator;
        let opportunity_id = &task.opportunity_id;
        let platform = &task.platform;

        self.transition(leg, LegStatus::Intent).await;

        // Step 2: acquire.
        let acquired = match self.adapter.acquire_position(&leg.snapshot()).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(opportunity = %opportunity_id, platform = %platform, error = %e, "Acquire failed");
                false
            }
        };
        if !acquired {
            let reason = "position not acquired".to_string();
            coordinator.notify_outcome(opportunity_id, platform, false, Some(reason.clone()));
            coordinator.cancel_opportunity(opportunity_id);
            self.fail(leg).await;
            return CycleOutcome::Failed(reason);
        }

        // Step 3: ready.
        if !coordinator.mark_ready(opportunity_id, platform) {
            let escalation = Escalation::warning(
                opportunity_id,
                platform,
                "partner left before this leg was ready, abandoning",
            );
            self.ctx.escalation.escalate(&escalation);
            self.ctx.publish(ExecutionEvent::Escalated(escalation));
            coordinator.cancel_opportunity(opportunity_id);
            self.transition(leg, LegStatus::Failed).await;
            return CycleOutcome::Abandoned(AbandonReason::PartnerGone);
        }
        self.transition(leg, LegStatus::Ready).await;

        // Step 4: rendezvous.
        if !coordinator
            .wait_for_partners_ready(opportunity_id, platform, self.ctx.config.ready_timeout)
            .await
        {
            self.drain_partner(task);
            self.transition(leg, LegStatus::Failed).await;
            return CycleOutcome::Abandoned(AbandonReason::PartnerTimeout);
        }

        // Step 5: place.
        let placement = match self.adapter.place(&leg.snapshot()).await {
            Ok(placement) => placement,
            Err(e) => Placement::rejected(format!("placement error: {e}")),
        };

        match placement {
            Placement::Placed { bet_ref } => {
                coordinator.notify_outcome(opportunity_id, platform, true, None);
                if let Err(e) = leg.update(|leg| leg.mark_placed(bet_ref.clone())) {
                    warn!(opportunity = %opportunity_id, platform = %platform, error = %e, "Leg not in placeable state");
                }
                self.persist(leg).await;
                self.ctx.metrics.incr(Counter::LegsPlaced);
                info!(opportunity = %opportunity_id, platform = %platform, bet_ref = %bet_ref, "Leg placed");

                self.resolve_placed(task, leg, &bet_ref).await
            }
            Placement::Rejected { reason, price_moved } => {
                coordinator.notify_outcome(opportunity_id, platform, false, Some(reason.clone()));
                self.fail(leg).await;
                warn!(
                    opportunity = %opportunity_id,
                    platform = %platform,
                    reason = %reason,
                    price_moved,
                    "Leg placement refused"
                );

                if price_moved && task.retry_policy.retries_price_moves() {
                    if let Err(e) = self
                        .ctx
                        .retry
                        .register_failed_leg(leg.clone(), platform, task.opportunity.clone())
                    {
                        warn!(opportunity = %opportunity_id, platform = %platform, error = %e, "Retry registration failed");
                    }
                }

                self.observe_partner(task).await;
                CycleOutcome::Failed(reason)
            }
        }
    }

    /// Step 6 for a placed leg.
    async fn resolve_placed(&self, task: &LegTask, leg: &LegHandle, bet_ref: &str) -> CycleOutcome {
        let coordinator = &self.ctx.coordinator;
        let opportunity_id = &task.opportunity_id;
        let platform = &task.platform;

        let reason = match coordinator
            .wait_for_partner_outcome(opportunity_id, platform, self.ctx.config.outcome_timeout)
            .await
        {
            PartnerOutcome::Success => {
                info!(opportunity = %opportunity_id, platform = %platform, "Both legs placed");
                return CycleOutcome::Hedged;
            }
            PartnerOutcome::Failed(reason) => reason,
            PartnerOutcome::Timeout => "partner outcome timed out".to_string(),
        };

        if !coordinator.request_rollback(opportunity_id, platform, &reason) {
            // Only refused once both legs are placed and neither is unwinding.
            info!(opportunity = %opportunity_id, platform = %platform, "Partner placed late, keeping leg");
            return CycleOutcome::Hedged;
        }
        self.ctx.metrics.incr(Counter::RollbacksRequested);
        self.ctx.publish(ExecutionEvent::RollbackRequested {
            opportunity_id: opportunity_id.clone(),
            platform: platform.clone(),
            reason: reason.clone(),
        });
        warn!(opportunity = %opportunity_id, platform = %platform, bet_ref, reason = %reason, "Rolling back placed leg");

        let rolled_back = match self.adapter.rollback(bet_ref, &leg.snapshot()).await {
            Ok(rolled_back) => rolled_back,
            Err(e) => {
                error!(opportunity = %opportunity_id, platform = %platform, error = %e, "Rollback call failed");
                false
            }
        };
        coordinator.notify_rollback_completed(opportunity_id, platform, rolled_back);

        if rolled_back {
            self.transition(leg, LegStatus::RolledBack).await;
            self.ctx.metrics.incr(Counter::RollbacksSucceeded);
            CycleOutcome::RolledBack
        } else {
            self.ctx.metrics.incr(Counter::RollbacksFailed);
            self.ctx.publish(ExecutionEvent::Escalated(Escalation::critical(
                opportunity_id,
                platform,
                format!("rollback of {bet_ref} failed: unhedged position is open"),
            )));
            CycleOutcome::RollbackFailed
        }
    }

    /// Step 6 for a failed leg: the partner handles its own rollback.
    async fn observe_partner(&self, task: &LegTask) {
        let partner = self
            .ctx
            .coordinator
            .wait_for_partner_outcome(&task.opportunity_id, &task.platform, self.ctx.config.outcome_timeout)
            .await;
        info!(
            opportunity = %task.opportunity_id,
            platform = %task.platform,
            partner = ?partner,
            "Observed partner outcome after own failure"
        );
    }

    /// Removes the partner's not-yet-started task so it cannot run alone.
    fn drain_partner(&self, task: &LegTask) {
        let Some(partner) = task.partner() else {
            return;
        };
        let Some(queue) = self.ctx.queues.get(partner) else {
            return;
        };

        for drained in queue.drain_opportunity(&task.opportunity_id) {
            self.ctx.coordinator.release_intent(&drained.opportunity_id, &drained.platform);
            drained.completion.arrive();
            self.ctx.metrics.incr(Counter::TasksDrained);
            warn!(
                opportunity = %drained.opportunity_id,
                platform = %drained.platform,
                "Drained partner task after readiness timeout"
            );
        }
    }

    async fn fail(&self, leg: &LegHandle) {
        self.ctx.metrics.incr(Counter::LegsFailed);
        self.transition(leg, LegStatus::Failed).await;
    }

    async fn transition(&self, leg: &LegHandle, next: LegStatus) {
        if let Err(e) = leg.transition(next) {
            warn!(platform = %self.platform(), error = %e, "Ignoring illegal leg transition");
            return;
        }
        self.persist(leg).await;
    }

    async fn persist(&self, leg: &LegHandle) {
        let snapshot = leg.snapshot();
        if let Err(e) = self.ctx.store.save(&snapshot).await {
            warn!(
                opportunity = %snapshot.opportunity_id,
                platform = %snapshot.platform,
                status = %snapshot.status,
                error = %e,
                "Failed to persist leg"
            );
        }
    }

    fn record(&self, result: &LegResult) {
        match &result.outcome {
            CycleOutcome::Hedged => self.ctx.metrics.incr(Counter::CyclesHedged),
            CycleOutcome::Abandoned(_) => self.ctx.metrics.incr(Counter::CyclesAbandoned),
            _ => {}
        }
        debug!(
            opportunity = %result.opportunity_id,
            platform = %result.platform,
            outcome = ?result.outcome,
            "Leg cycle finished"
        );
        self.ctx.publish(ExecutionEvent::LegCompleted(result.clone()));
    }
}
