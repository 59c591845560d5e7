//! labflow - laboratory workflow execution engine
//!
//! Main entry point for the labflow CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, Registry};
use tracing_subscriber::prelude::*;

mod commands;
mod sim;

use commands::{route, run, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// labflow - run laboratory workflows against a simulated lab
#[derive(Parser)]
#[command(name = "labflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory holding config.toml (default: platform config dir)
    #[arg(long, global = true, env = "LABFLOW_CONFIG_DIR")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow to completion
    Run(run::RunArgs),

    /// Check a lab file and print a summary
    Validate(validate::ValidateArgs),

    /// Show the planned route between two locations
    Route(route::RouteArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = labflow_config::discover(None, cli.config.as_deref());
    let logging = loaded.config.logging();

    let filter = if cli.verbose {
        "labflow=debug,labflow_engine=debug,labflow_config=debug,info".to_string()
    } else {
        logging
            .level
            .clone()
            .unwrap_or_else(|| "labflow=info,labflow_engine=info,warn".to_string())
    };

    // Optional rolling file output, kept alive by the guard until exit
    let mut _guard = None;
    let file_layer: Option<Box<dyn Layer<Registry> + Send + Sync>> = logging.file.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "labflow.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _guard = Some(guard);
        let file_filter =
            tracing_subscriber::EnvFilter::new("labflow=trace,labflow_engine=trace,info");
        if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(file_filter)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(file_filter)
                .boxed()
        }
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    for warning in &loaded.warnings {
        tracing::warn!(warning = %warning, "settings layer skipped");
    }

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        engine: loaded.config.engine(),
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Route(args) => route::run(args, &ctx).await,
    }
}
