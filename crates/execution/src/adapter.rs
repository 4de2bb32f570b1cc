use std::collections::HashMap;
use std::sync::Arc;

use legsync_core::{BetExecutionAdapter, Platform};

use crate::error::ExecutionError;

/// Bet execution adapters selected by platform identity.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn BetExecutionAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under the platform it reports.
    ///
    /// # Errors
    /// Returns `ExecutionError::DuplicateAdapter` if the platform already has one.
    pub fn register(&mut self, adapter: Arc<dyn BetExecutionAdapter>) -> Result<(), ExecutionError> {
        let platform = adapter.platform().clone();
        if self.adapters.contains_key(&platform) {
            return Err(ExecutionError::DuplicateAdapter(platform));
        }
        self.adapters.insert(platform, adapter);
        Ok(())
    }

    /// # Errors
    /// Returns `ExecutionError::UnknownPlatform` if nothing is registered.
    pub fn get(&self, platform: &Platform) -> Result<Arc<dyn BetExecutionAdapter>, ExecutionError> {
        self.adapters
            .get(platform)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownPlatform(platform.clone()))
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.adapters.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
