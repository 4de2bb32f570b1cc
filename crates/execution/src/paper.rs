//! Scripted bet execution adapter for simulation and tests.
//!
//! Makes no network calls. Each call follows a [`PaperScript`], either the
//! adapter-wide default or an override for a specific opportunity, and every
//! placement and rollback is recorded for inspection.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use legsync_core::{BetExecutionAdapter, Leg, OpportunityId, Placement, Platform};

/// How the paper platform answers a placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperPlacement {
    /// Accept under a generated reference.
    Accept,
    /// Accept under the given reference.
    AcceptAs(String),
    /// Refuse for a reason unrelated to price.
    Reject(String),
    /// Refuse because the price moved.
    PriceMoved(String),
    /// Fail the call itself.
    Error(String),
}

/// Behaviour for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperScript {
    pub acquire: bool,
    /// Delay before `acquire_position` answers.
    pub acquire_delay: Duration,
    pub placement: PaperPlacement,
    pub rollback: bool,
}

impl Default for PaperScript {
    fn default() -> Self {
        Self {
            acquire: true,
            acquire_delay: Duration::ZERO,
            placement: PaperPlacement::Accept,
            rollback: true,
        }
    }
}

impl PaperScript {
    #[must_use]
    pub fn accepting() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_placement(mut self, placement: PaperPlacement) -> Self {
        self.placement = placement;
        self
    }

    #[must_use]
    pub fn with_acquire(mut self, acquire: bool) -> Self {
        self.acquire = acquire;
        self
    }

    #[must_use]
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    #[must_use]
    pub fn with_rollback(mut self, rollback: bool) -> Self {
        self.rollback = rollback;
        self
    }
}

/// A bet accepted by the paper platform.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperBet {
    pub opportunity_id: OpportunityId,
    pub bet_ref: String,
    pub leg: Leg,
}

/// Simulated platform.
pub struct PaperAdapter {
    platform: Platform,
    latency: Duration,
    default_script: RwLock<PaperScript>,
    overrides: RwLock<HashMap<OpportunityId, PaperScript>>,
    placed: Mutex<Vec<PaperBet>>,
    rolled_back: Mutex<Vec<String>>,
    cleared: AtomicU32,
}

impl std::fmt::Debug for PaperAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperAdapter")
            .field("platform", &self.platform)
            .field("latency", &self.latency)
            .field("placed", &self.placed.lock().len())
            .finish()
    }
}

impl PaperAdapter {
    /// Creates an adapter that accepts everything instantly.
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            latency: Duration::ZERO,
            default_script: RwLock::new(PaperScript::default()),
            overrides: RwLock::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(Vec::new()),
            cleared: AtomicU32::new(0),
        }
    }

    /// Delay applied to placement and rollback calls.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_script(self, script: PaperScript) -> Self {
        *self.default_script.write() = script;
        self
    }

    /// Overrides behaviour for one opportunity.
    pub fn script_for(&self, opportunity_id: OpportunityId, script: PaperScript) {
        self.overrides.write().insert(opportunity_id, script);
    }

    fn script(&self, opportunity_id: &OpportunityId) -> PaperScript {
        self.overrides
            .read()
            .get(opportunity_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.read().clone())
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    #[must_use]
    pub fn placed_bets(&self) -> Vec<PaperBet> {
        self.placed.lock().clone()
    }

    #[must_use]
    pub fn rollbacks(&self) -> Vec<String> {
        self.rolled_back.lock().clone()
    }

    /// Number of `clear_pending` calls seen.
    #[must_use]
    pub fn cleared(&self) -> u32 {
        self.cleared.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BetExecutionAdapter for PaperAdapter {
    fn platform(&self) -> &Platform {
        &self.platform
    }

    async fn acquire_position(&self, leg: &Leg) -> Result<bool> {
        let script = self.script(&leg.opportunity_id);
        if !script.acquire_delay.is_zero() {
            tokio::time::sleep(script.acquire_delay).await;
        }
        debug!(platform = %self.platform, opportunity = %leg.opportunity_id, acquired = script.acquire, "Paper acquire");
        Ok(script.acquire)
    }

    async fn place(&self, leg: &Leg) -> Result<Placement> {
        self.simulate_latency().await;

        let bet_ref = match self.script(&leg.opportunity_id).placement {
            PaperPlacement::Accept => format!("PAPER-{}", uuid::Uuid::new_v4().simple()),
            PaperPlacement::AcceptAs(bet_ref) => bet_ref,
            PaperPlacement::Reject(reason) => return Ok(Placement::rejected(reason)),
            PaperPlacement::PriceMoved(reason) => return Ok(Placement::price_moved(reason)),
            PaperPlacement::Error(message) => return Err(anyhow!(message)),
        };

        info!(
            platform = %self.platform,
            opportunity = %leg.opportunity_id,
            bet_ref = %bet_ref,
            odds = %leg.odds,
            stake = %leg.stake,
            "Paper bet placed"
        );
        self.placed.lock().push(PaperBet {
            opportunity_id: leg.opportunity_id.clone(),
            bet_ref: bet_ref.clone(),
            leg: leg.clone(),
        });
        Ok(Placement::placed(bet_ref))
    }

    async fn rollback(&self, bet_ref: &str, leg: &Leg) -> Result<bool> {
        self.simulate_latency().await;

        let succeeded = self.script(&leg.opportunity_id).rollback;
        if succeeded {
            self.rolled_back.lock().push(bet_ref.to_string());
        }
        info!(platform = %self.platform, bet_ref, succeeded, "Paper rollback");
        Ok(succeeded)
    }

    async fn clear_pending(&self, _leg: &Leg) -> Result<()> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
