//! Runtime around the two-leg execution core.
//!
//! The [`OpportunityDispatcher`] turns detected opportunities into leg tasks,
//! the [`OddsIngestPool`] feeds live odds to the retry registry, and a
//! [`RetryRedriveWorker`] per platform turns ready signals back into
//! dispatches. The [`ExposureBreaker`] halts dispatch after failures.
//! [`Runtime::start`] wires it all up and returns a [`RuntimeHandle`].

pub mod breaker;
pub mod dispatcher;
pub mod odds_ingest;
pub mod retry_worker;
pub mod runtime;
pub mod source;

pub use breaker::{BreakerError, BreakerState, ExposureBreaker};
pub use dispatcher::{DispatchError, OpportunityDispatcher};
pub use odds_ingest::OddsIngestPool;
pub use retry_worker::RetryRedriveWorker;
pub use runtime::{Collaborators, Runtime, RuntimeHandle, RuntimeStatus};
pub use source::{ChannelOddsStream, JsonFileSource, JsonLinesOddsStream, QueuedSource};
