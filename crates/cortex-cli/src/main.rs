//! Cortex CLI entry point.
//!
//! Binary name: `cortex`
//!
//! Parses CLI arguments, installs tracing, then dispatches to the workflow
//! command handlers.

mod cli;

use clap::Parser;
use cortex_observe::tracing_setup::{init_tracing, shutdown_tracing};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,cortex=debug",
        _ => "trace",
    };

    if let Err(e) = init_tracing(cli.log_format, filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = match cli.command {
        Commands::Validate { file } => cli::workflow::validate(&file, cli.json),
        Commands::Plan { file } => cli::workflow::plan(&file, cli.json),
        Commands::Run {
            file,
            agents,
            config,
        } => cli::workflow::run(&file, agents, config.as_deref(), cli.json, cli.quiet).await,
    };

    shutdown_tracing();
    result
}
