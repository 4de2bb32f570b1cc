//! Per-opportunity rendezvous between the two execution agents.
//!
//! Each opportunity gets one entry, created lazily by the first
//! `register_intent` (or by an early `cancel_opportunity`) and removed by the
//! second `release_intent`. Entries hold:
//!
//! - the intents registered by each platform and the odds they quoted,
//! - a two-party [`Barrier`] for readiness,
//! - the placement outcome each platform reported,
//! - rollback bookkeeping.
//!
//! Per platform the entry walks
//! `Unregistered → IntentRegistered → Ready → Placed | Failed →
//! [RollbackRequested → RollbackSucceeded | RollbackFailed] → Released`.
//! `RollbackFailed` is terminal; it raises a critical escalation and is never
//! retried automatically.
//!
//! Lock order is always `entries` before an entry's `state`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use legsync_core::{Escalation, EscalationSink, LogEscalation, OpportunityId, Platform};

use crate::barrier::{Barrier, BarrierWait};

// =============================================================================
// Public types
// =============================================================================

/// Protocol position of one platform within one opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantStep {
    Unregistered,
    IntentRegistered,
    Ready,
    Placed,
    Failed,
    RollbackRequested,
    RollbackSucceeded,
    RollbackFailed,
    Released,
}

/// What an agent learned about its partner's placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartnerOutcome {
    /// Partner's leg was placed.
    Success,
    /// Partner's leg did not land (or partner left without placing).
    Failed(String),
    /// Partner did not report in time.
    Timeout,
}

/// Placement result reported by one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedOutcome {
    pub success: bool,
    pub reason: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Rollback bookkeeping for one platform's leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub requested_by: Platform,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub completed: bool,
    pub success: Option<bool>,
}

/// Read-only copy of an entry, for diagnostics and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub opportunity_id: OpportunityId,
    pub participants: Vec<Platform>,
    pub intents: HashMap<Platform, Decimal>,
    pub ready: HashSet<Platform>,
    pub outcomes: HashMap<Platform, ReportedOutcome>,
    pub steps: HashMap<Platform, ParticipantStep>,
    pub rollbacks: HashMap<Platform, RollbackRecord>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Entry state
// =============================================================================

#[derive(Debug)]
struct SyncState {
    participants: Vec<Platform>,
    intents: HashMap<Platform, Decimal>,
    ready: HashSet<Platform>,
    departed: HashSet<Platform>,
    outcomes: HashMap<Platform, ReportedOutcome>,
    released: HashSet<Platform>,
    steps: HashMap<Platform, ParticipantStep>,
    rollbacks: HashMap<Platform, RollbackRecord>,
    cancelled: bool,
    created_at: DateTime<Utc>,
    created: Instant,
}

impl SyncState {
    fn new() -> Self {
        Self {
            participants: Vec::with_capacity(2),
            intents: HashMap::new(),
            ready: HashSet::new(),
            departed: HashSet::new(),
            outcomes: HashMap::new(),
            released: HashSet::new(),
            steps: HashMap::new(),
            rollbacks: HashMap::new(),
            cancelled: false,
            created_at: Utc::now(),
            created: Instant::now(),
        }
    }

    /// Admits `platform` as one of the two participants.
    fn admit(&mut self, platform: &Platform) -> bool {
        if self.participants.contains(platform) {
            return true;
        }
        if self.participants.len() >= 2 {
            return false;
        }
        self.participants.push(platform.clone());
        true
    }

    fn partner_of(&self, platform: &Platform) -> Option<&Platform> {
        self.participants.iter().find(|p| *p != platform)
    }

    fn set_step(&mut self, platform: &Platform, step: ParticipantStep) {
        self.steps.insert(platform.clone(), step);
    }

    /// Resolves the partner's outcome if it is already decided.
    fn partner_outcome(&self, platform: &Platform) -> Option<PartnerOutcome> {
        let Some(partner) = self.partner_of(platform) else {
            return self
                .cancelled
                .then(|| PartnerOutcome::Failed("partner never registered".to_string()));
        };

        // A partner that already started unwinding is not hedging us, even if
        // its placement succeeded.
        if let Some(rollback) = self.rollbacks.get(partner) {
            return Some(PartnerOutcome::Failed(format!(
                "partner rolled back: {}",
                rollback.reason
            )));
        }
        if let Some(outcome) = self.outcomes.get(partner) {
            return Some(if outcome.success {
                PartnerOutcome::Success
            } else {
                PartnerOutcome::Failed(
                    outcome
                        .reason
                        .clone()
                        .unwrap_or_else(|| "unspecified".to_string()),
                )
            });
        }
        if self.released.contains(partner) {
            return Some(PartnerOutcome::Failed(
                "partner released without reporting".to_string(),
            ));
        }
        // A partner past readiness is placing; cancellation no longer stops it.
        if self.cancelled && !self.ready.contains(partner) {
            return Some(PartnerOutcome::Failed(
                "cancelled before partner was ready".to_string(),
            ));
        }
        None
    }

    fn both_placed(&self) -> bool {
        self.participants.len() == 2
            && self
                .participants
                .iter()
                .all(|p| self.outcomes.get(p).is_some_and(|o| o.success))
    }

    /// Both legs placed and neither side has started unwinding.
    fn hedged(&self) -> bool {
        self.both_placed() && self.rollbacks.is_empty()
    }
}

#[derive(Debug)]
struct SyncEntry {
    state: Mutex<SyncState>,
    ready: Barrier,
    changed: watch::Sender<u64>,
}

impl SyncEntry {
    fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(SyncState::new()),
            ready: Barrier::two_party(),
            changed,
        }
    }

    /// Wakes outcome waiters. Must be called after the state change is made.
    fn bump(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Thread-safe registry of per-opportunity synchronization state.
pub struct SyncCoordinator {
    entries: Mutex<HashMap<OpportunityId, Arc<SyncEntry>>>,
    escalation: Arc<dyn EscalationSink>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(LogEscalation))
    }
}

impl SyncCoordinator {
    /// Creates an empty coordinator that raises alerts through `escalation`.
    #[must_use]
    pub fn new(escalation: Arc<dyn EscalationSink>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            escalation,
        }
    }

    fn entry(&self, opportunity_id: &OpportunityId) -> Option<Arc<SyncEntry>> {
        self.entries.lock().get(opportunity_id).cloned()
    }

    /// Registers `platform`'s intent to execute its leg at `odds`.
    ///
    /// Returns false without side effects if the opportunity is already
    /// cancelled, if this platform already registered or released, or if two
    /// other platforms already participate.
    pub fn register_intent(&self, opportunity_id: &OpportunityId, platform: &Platform, odds: Decimal) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(opportunity_id.clone())
            .or_insert_with(|| Arc::new(SyncEntry::new()))
            .clone();
        let mut state = entry.state.lock();

        if state.cancelled {
            info!(
                opportunity = %opportunity_id,
                platform = %platform,
                "Intent refused: opportunity already cancelled"
            );
            return false;
        }
        if state.intents.contains_key(platform) || state.released.contains(platform) {
            warn!(
                opportunity = %opportunity_id,
                platform = %platform,
                "Intent refused: platform already registered"
            );
            return false;
        }
        if !state.admit(platform) {
            warn!(
                opportunity = %opportunity_id,
                platform = %platform,
                participants = ?state.participants,
                "Intent refused: opportunity already has two participants"
            );
            return false;
        }

        state.intents.insert(platform.clone(), odds);
        state.set_step(platform, ParticipantStep::IntentRegistered);
        drop(state);
        drop(entries);

        debug!(opportunity = %opportunity_id, platform = %platform, odds = %odds, "Intent registered");
        true
    }

    /// Marks `platform` ready to place.
    ///
    /// Returns false if the partner already timed out and left, the
    /// opportunity was cancelled, or `platform` never registered intent.
    pub fn mark_ready(&self, opportunity_id: &OpportunityId, platform: &Platform) -> bool {
        let Some(entry) = self.entry(opportunity_id) else {
            warn!(opportunity = %opportunity_id, platform = %platform, "mark_ready without state");
            return false;
        };
        let mut state = entry.state.lock();

        if state.cancelled || !state.departed.is_empty() {
            warn!(
                opportunity = %opportunity_id,
                platform = %platform,
                departed = ?state.departed,
                "Late arrival: partner already gave up"
            );
            return false;
        }
        if !state.intents.contains_key(platform) {
            warn!(opportunity = %opportunity_id, platform = %platform, "mark_ready before intent");
            return false;
        }

        if state.ready.insert(platform.clone()) {
            // Arrive under the state lock so a concurrent timeout sees it.
            entry.ready.arrive();
        }
        state.set_step(platform, ParticipantStep::Ready);
        drop(state);
        entry.bump();
        true
    }

    /// Waits until both platforms are ready, or `timeout` elapses.
    ///
    /// On timeout or cancellation returns false; a timeout also marks the
    /// caller as departed and cancels the opportunity so the partner cannot
    /// proceed alone. The caller remains responsible for draining any task
    /// still queued for the partner.
    pub async fn wait_for_partners_ready(
        &self,
        opportunity_id: &OpportunityId,
        platform: &Platform,
        timeout: Duration,
    ) -> bool {
        let Some(entry) = self.entry(opportunity_id) else {
            return false;
        };
        if !entry.state.lock().ready.contains(platform) {
            warn!(opportunity = %opportunity_id, platform = %platform, "Waiting for partners before being ready");
            return false;
        }

        match entry.ready.wait(timeout).await {
            BarrierWait::Released => true,
            BarrierWait::Broken => {
                info!(opportunity = %opportunity_id, platform = %platform, "Readiness wait cancelled");
                false
            }
            BarrierWait::TimedOut => {
                let mut state = entry.state.lock();
                if entry.ready.is_released() {
                    return true;
                }
                state.departed.insert(platform.clone());
                state.cancelled = true;
                entry.ready.break_barrier();
                drop(state);
                entry.bump();

                warn!(
                    opportunity = %opportunity_id,
                    platform = %platform,
                    timeout_ms = timeout.as_millis() as u64,
                    "Partner not ready in time, abandoning opportunity"
                );
                false
            }
        }
    }

    /// Records `platform`'s placement result and wakes its partner.
    pub fn notify_outcome(
        &self,
        opportunity_id: &OpportunityId,
        platform: &Platform,
        success: bool,
        reason: Option<String>,
    ) {
        let Some(entry) = self.entry(opportunity_id) else {
            warn!(opportunity = %opportunity_id, platform = %platform, "Outcome for unknown opportunity");
            return;
        };
        let mut state = entry.state.lock();
        state.outcomes.insert(
            platform.clone(),
            ReportedOutcome {
                success,
                reason: reason.clone(),
                reported_at: Utc::now(),
            },
        );
        state.set_step(
            platform,
            if success {
                ParticipantStep::Placed
            } else {
                ParticipantStep::Failed
            },
        );
        drop(state);
        entry.bump();

        info!(
            opportunity = %opportunity_id,
            platform = %platform,
            success,
            reason = reason.as_deref().unwrap_or(""),
            "Outcome reported"
        );
    }

    /// Waits for the partner's placement result.
    pub async fn wait_for_partner_outcome(
        &self,
        opportunity_id: &OpportunityId,
        platform: &Platform,
        timeout: Duration,
    ) -> PartnerOutcome {
        let Some(entry) = self.entry(opportunity_id) else {
            return PartnerOutcome::Timeout;
        };
        let deadline = Instant::now() + timeout;
        let mut rx = entry.changed.subscribe();

        loop {
            rx.borrow_and_update();
            if let Some(outcome) = entry.state.lock().partner_outcome(platform) {
                return outcome;
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return PartnerOutcome::Timeout,
                Err(_) => {
                    let last = entry.state.lock().partner_outcome(platform);
                    if last.is_none() {
                        warn!(
                            opportunity = %opportunity_id,
                            platform = %platform,
                            "Partner outcome not reported in time"
                        );
                    }
                    return last.unwrap_or(PartnerOutcome::Timeout);
                }
            }
        }
    }

    /// Records that `platform` is unwinding its placed leg.
    ///
    /// Returns false (and records nothing) if both legs were placed and
    /// neither side has started unwinding, since a hedged opportunity must
    /// never be unwound. Once one side has rolled back, a partner that placed
    /// late is always allowed to follow.
    pub fn request_rollback(&self, opportunity_id: &OpportunityId, platform: &Platform, reason: &str) -> bool {
        let Some(entry) = self.entry(opportunity_id) else {
            warn!(opportunity = %opportunity_id, platform = %platform, "Rollback for unknown opportunity");
            return false;
        };
        let mut state = entry.state.lock();
        if state.hedged() {
            warn!(
                opportunity = %opportunity_id,
                platform = %platform,
                "Rollback refused: both legs placed"
            );
            return false;
        }

        if state.rollbacks.contains_key(platform) {
            warn!(opportunity = %opportunity_id, platform = %platform, "Rollback already requested");
            return false;
        }

        state.rollbacks.insert(
            platform.clone(),
            RollbackRecord {
                requested_by: platform.clone(),
                reason: reason.to_string(),
                requested_at: Utc::now(),
                completed: false,
                success: None,
            },
        );
        state.set_step(platform, ParticipantStep::RollbackRequested);
        drop(state);
        entry.bump();

        self.escalation.escalate(&Escalation::warning(
            opportunity_id,
            platform,
            format!("rollback requested: {reason}"),
        ));
        true
    }

    /// Records the result of a rollback. A failed rollback escalates.
    pub fn notify_rollback_completed(&self, opportunity_id: &OpportunityId, platform: &Platform, success: bool) {
        let Some(entry) = self.entry(opportunity_id) else {
            warn!(opportunity = %opportunity_id, platform = %platform, "Rollback result for unknown opportunity");
            return;
        };
        let mut state = entry.state.lock();
        if let Some(rollback) = state.rollbacks.get_mut(platform) {
            rollback.completed = true;
            rollback.success = Some(success);
        }
        state.set_step(
            platform,
            if success {
                ParticipantStep::RollbackSucceeded
            } else {
                ParticipantStep::RollbackFailed
            },
        );
        drop(state);
        entry.bump();

        if success {
            info!(opportunity = %opportunity_id, platform = %platform, "Rollback completed");
        } else {
            self.escalation.escalate(&Escalation::critical(
                opportunity_id,
                platform,
                "rollback failed: unhedged position is open",
            ));
        }
    }

    /// Marks the opportunity dead for both parties and wakes every waiter.
    ///
    /// Cancellation does not affect agents that are already past the
    /// readiness barrier.
    pub fn cancel_opportunity(&self, opportunity_id: &OpportunityId) {
        let entry = self
            .entries
            .lock()
            .entry(opportunity_id.clone())
            .or_insert_with(|| Arc::new(SyncEntry::new()))
            .clone();

        let mut state = entry.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if !entry.ready.is_released() {
            entry.ready.break_barrier();
        }
        drop(state);
        entry.bump();

        info!(opportunity = %opportunity_id, "Opportunity cancelled");
    }

    /// Releases `platform`'s hold on the opportunity. Removes the entry once
    /// both platforms have released.
    ///
    /// A platform that never registered forfeits its slot, so it cannot join
    /// later. Must be called exactly once per platform per cycle, and never by
    /// a cycle whose registration was refused because the platform already
    /// holds an intent: that release would be credited to the live cycle.
    pub fn release_intent(&self, opportunity_id: &OpportunityId, platform: &Platform) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(opportunity_id).cloned() else {
            debug!(opportunity = %opportunity_id, platform = %platform, "Release for absent state");
            return;
        };
        let mut state = entry.state.lock();

        if !state.admit(platform) {
            warn!(opportunity = %opportunity_id, platform = %platform, "Release from non-participant ignored");
            return;
        }
        if !state.released.insert(platform.clone()) {
            warn!(opportunity = %opportunity_id, platform = %platform, "Intent released twice");
            return;
        }
        state.set_step(platform, ParticipantStep::Released);
        let done = state.released.len() >= 2;
        drop(state);

        if done {
            entries.remove(opportunity_id);
            debug!(opportunity = %opportunity_id, "Synchronization state discarded");
        }
        drop(entries);
        entry.bump();
    }

    /// Removes entries older than `max_age`, waking any waiter on them.
    ///
    /// Catches opportunities whose partner never showed up at all, so its
    /// release never came.
    pub fn prune_stale(&self, max_age: Duration) -> Vec<OpportunityId> {
        let stale: Vec<(OpportunityId, Arc<SyncEntry>)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<OpportunityId> = entries
                .iter()
                .filter(|(_, entry)| entry.state.lock().created.elapsed() >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in &stale {
            let mut state = entry.state.lock();
            state.cancelled = true;
            if !entry.ready.is_released() {
                entry.ready.break_barrier();
            }
            let participants = state.participants.clone();
            drop(state);
            entry.bump();
            warn!(opportunity = %id, ?participants, "Pruned stale synchronization state");
        }

        stale.into_iter().map(|(id, _)| id).collect()
    }

    /// Returns true while state exists for the opportunity.
    #[must_use]
    pub fn contains(&self, opportunity_id: &OpportunityId) -> bool {
        self.entries.lock().contains_key(opportunity_id)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns true if the opportunity has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self, opportunity_id: &OpportunityId) -> bool {
        self.entry(opportunity_id)
            .is_some_and(|entry| entry.state.lock().cancelled)
    }

    /// Returns true if `platform` registered an intent on the live entry,
    /// whether or not it has released since.
    #[must_use]
    pub fn holds_intent(&self, opportunity_id: &OpportunityId, platform: &Platform) -> bool {
        self.entry(opportunity_id).is_some_and(|entry| {
            let state = entry.state.lock();
            state.intents.contains_key(platform) || state.released.contains(platform)
        })
    }

    /// Current protocol step of `platform`.
    #[must_use]
    pub fn step(&self, opportunity_id: &OpportunityId, platform: &Platform) -> ParticipantStep {
        self.entry(opportunity_id)
            .and_then(|entry| entry.state.lock().steps.get(platform).copied())
            .unwrap_or(ParticipantStep::Unregistered)
    }

    /// Copies the entry for diagnostics.
    #[must_use]
    pub fn snapshot(&self, opportunity_id: &OpportunityId) -> Option<SyncSnapshot> {
        let entry = self.entry(opportunity_id)?;
        let state = entry.state.lock();
        Some(SyncSnapshot {
            opportunity_id: opportunity_id.clone(),
            participants: state.participants.clone(),
            intents: state.intents.clone(),
            ready: state.ready.clone(),
            outcomes: state.outcomes.clone(),
            steps: state.steps.clone(),
            rollbacks: state.rollbacks.clone(),
            cancelled: state.cancelled,
            created_at: state.created_at,
        })
    }
}
