//! Two-party synchronization for cross-platform bet execution.
//!
//! - [`barrier`]: a timeout-aware N-party barrier, used for readiness and for
//!   each opportunity's completion signal.
//! - [`coordinator`]: the per-opportunity rendezvous (intent, readiness,
//!   outcome exchange, rollback bookkeeping, cancellation and release).

pub mod barrier;
pub mod coordinator;

pub use barrier::{Barrier, BarrierWait};
pub use coordinator::{
    ParticipantStep, PartnerOutcome, ReportedOutcome, RollbackRecord, SyncCoordinator, SyncSnapshot,
};
