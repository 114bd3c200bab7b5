//! till-agent entry point.
//!
//! Thin by design: parse flags, load configuration from the environment,
//! install the SIGINT handler and hand control to the supervisor.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use till_agent::{RunOptions, Supervisor};
use till_config::AgentConfig;

#[derive(Parser)]
#[command(name = "till-agent")]
#[command(about = "TillStream point-of-sale change-data-capture agent", long_about = None)]
struct Cli {
    /// Tear down the change-log instrumentation, then start normally.
    #[arg(long)]
    reset: bool,

    /// Tear down the change-log instrumentation and exit.
    #[arg(long = "reset-and-exit")]
    reset_and_exit: bool,
}

fn main() -> Result<()> {
    // Load .env if present; production injects env vars directly.
    let _ = dotenvy::dotenv();

    init_tracing();

    let cli = Cli::parse();
    let config = AgentConfig::from_env().context("configuration error")?;

    let supervisor = Supervisor::new(config);

    let stop = supervisor.stop_handle();
    ctrlc::set_handler(move || {
        info!("shutdown signal received, exiting gracefully");
        stop.set();
    })
    .context("install signal handler")?;

    supervisor.run(RunOptions {
        reset: cli.reset,
        reset_and_exit: cli.reset_and_exit,
    })
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
