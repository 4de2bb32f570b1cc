//! Leg execution for two-platform opportunities.
//!
//! Each platform runs one [`PlatformWorker`] that pops [`LegTask`]s from its
//! [`DispatchQueue`] and hands them to a [`LegExecutionDriver`], which walks
//! the task through the [`legsync_sync::SyncCoordinator`] protocol and calls
//! the platform's [`legsync_core::BetExecutionAdapter`] for the real work.

pub mod adapter;
pub mod driver;
pub mod error;
pub mod paper;
pub mod queue;
pub mod task;
pub mod worker;

pub use adapter::AdapterRegistry;
pub use driver::{CycleGuard, ExecutionContext, LegExecutionDriver};
pub use error::ExecutionError;
pub use paper::{PaperAdapter, PaperBet, PaperPlacement, PaperScript};
pub use queue::{DispatchQueue, DispatchQueues};
pub use task::{LegTask, RetryPolicy};
pub use worker::PlatformWorker;
