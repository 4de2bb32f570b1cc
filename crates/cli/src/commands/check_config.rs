//! Configuration check command.
//!
//! Loads the same layered configuration the runtime would use (base file,
//! optional profile overlay, `LEGSYNC_` environment overrides), validates it,
//! and prints the result as JSON.

use anyhow::{Context, Result};
use clap::Args;

use legsync_core::ConfigLoader;

#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Profile overlay (reads Config.{profile}.toml next to the base file)
    #[arg(short, long)]
    pub profile: Option<String>,
}

/// Prints the effective configuration, or fails on the first invalid field.
///
/// # Errors
/// Returns an error if the configuration cannot be loaded or is invalid.
pub fn run_check_config(args: &CheckConfigArgs) -> Result<()> {
    let config = ConfigLoader::load_from(&args.config, args.profile.as_deref())?;
    let rendered = serde_json::to_string_pretty(&config).context("Failed to render configuration")?;

    println!("{rendered}");
    println!();
    println!(
        "Configuration OK: {} platforms, ready {}ms, outcome {}ms, retry tolerance {}%",
        config.dispatch.platforms.len(),
        config.execution.ready_timeout.as_millis(),
        config.execution.outcome_timeout.as_millis(),
        config.retry.tolerance_pct,
    );
    Ok(())
}
