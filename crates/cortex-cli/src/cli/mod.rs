//! CLI command definitions for the `cortex` binary.
//!
//! Uses clap derive macros for argument parsing. Every command takes a
//! workflow definition file (YAML or JSON, chosen by extension).

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cortex_observe::tracing_setup::LogFormat;

/// Plan and run dependency-ordered workflows over a pool of agents.
#[derive(Parser)]
#[command(name = "cortex", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format (text or json).
    #[arg(long, global = true, default_value = "text", env = "CORTEX_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Export spans through the OpenTelemetry stdout exporter.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a workflow file and check its definition and dependency graph.
    Validate {
        /// Workflow file (.yaml, .yml or .json)
        file: PathBuf,
    },

    /// Show the execution batches a workflow would run in.
    Plan {
        /// Workflow file (.yaml, .yml or .json)
        file: PathBuf,
    },

    /// Execute a workflow against local echo agents.
    Run {
        /// Workflow file (.yaml, .yml or .json)
        file: PathBuf,

        /// Number of local agents to register.
        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Orchestration config (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
