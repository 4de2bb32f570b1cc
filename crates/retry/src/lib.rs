//! Odds-driven retry of legs that failed on a stale price.
//!
//! A failed leg is registered with its last target odds. Live odds updates are
//! matched against an [`OddsBand`] around that target; on a match the leg is
//! re-armed (FAILED → PENDING) and a [`ReadySignal`] is queued for the
//! platform's re-drive worker.

pub mod error;
pub mod registry;
pub mod spec;

pub use error::RetryError;
pub use registry::{ReadySignal, RetryRegistry};
pub use spec::{OddsBand, RetrySpec};
