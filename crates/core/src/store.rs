use crate::traits::LegStore;
use crate::types::{Leg, OpportunityId, Platform};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local leg store, keeping the latest state and the status history
/// of every leg.
#[derive(Debug, Default)]
pub struct InMemoryLegStore {
    legs: RwLock<HashMap<(OpportunityId, Platform), Vec<Leg>>>,
}

impl InMemoryLegStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every saved state of a leg, oldest first.
    #[must_use]
    pub fn history(&self, opportunity_id: &OpportunityId, platform: &Platform) -> Vec<Leg> {
        self.legs
            .read()
            .get(&(opportunity_id.clone(), platform.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct legs stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.legs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.legs.read().is_empty()
    }
}

#[async_trait]
impl LegStore for InMemoryLegStore {
    async fn save(&self, leg: &Leg) -> Result<()> {
        self.legs
            .write()
            .entry((leg.opportunity_id.clone(), leg.platform.clone()))
            .or_default()
            .push(leg.clone());
        Ok(())
    }

    async fn load(&self, opportunity_id: &OpportunityId, platform: &Platform) -> Result<Option<Leg>> {
        Ok(self
            .legs
            .read()
            .get(&(opportunity_id.clone(), platform.clone()))
            .and_then(|history| history.last().cloned()))
    }
}
