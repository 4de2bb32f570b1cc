use thiserror::Error;

use legsync_core::{CoreError, OpportunityId, Platform};

/// Errors raised while wiring or dispatching leg tasks.
///
/// The execution cycle itself never returns these: protocol failures are
/// reported as a [`legsync_core::CycleOutcome`].
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("No adapter registered for platform {0}")]
    UnknownPlatform(Platform),

    #[error("No dispatch queue for platform {0}")]
    NoQueue(Platform),

    #[error("Opportunity {opportunity} has no leg on platform {platform}")]
    NoLeg {
        opportunity: OpportunityId,
        platform: Platform,
    },

    #[error("Adapter for {0} registered twice")]
    DuplicateAdapter(Platform),

    #[error(transparent)]
    Core(#[from] CoreError),
}
