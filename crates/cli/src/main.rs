use clap::{Parser, Subcommand};

mod commands;

use commands::{CheckConfigArgs, RunArgs, SimulateArgs};

#[derive(Parser)]
#[command(name = "legsync")]
#[command(about = "Synchronized two-leg bet execution across bookmakers", long_about = None)]
struct Cli {
    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the execution runtime against a file of opportunities
    Run(RunArgs),
    /// Run a scripted scenario against paper platforms
    Simulate(SimulateArgs),
    /// Load, validate and print the effective configuration
    CheckConfig(CheckConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    match cli.command {
        Commands::Run(args) => commands::run_runtime(args).await?,
        Commands::Simulate(args) => commands::run_simulation(args).await?,
        Commands::CheckConfig(args) => commands::run_check_config(&args)?,
    }

    Ok(())
}
