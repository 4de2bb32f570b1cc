//! CLI commands for the execution runtime.

pub mod check_config;
pub mod run;
pub mod simulate;

pub use check_config::{run_check_config, CheckConfigArgs};
pub use run::{run_runtime, RunArgs};
pub use simulate::{run_simulation, SimulateArgs};
