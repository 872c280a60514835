//! msgpipe - Staged Message Replay Pipeline
//!
//! Loads a topology from one or more configuration files, runs every step
//! and exits with the run's exit code.

use anyhow::Context;
use clap::Parser;
use msgpipe_rs::{CodecRegistry, TopologyConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "msgpipe", version, about = "Barrier-synchronized message replay")]
struct Cli {
    /// Topology files (.toml, .json or property files, later ones override)
    #[arg(required = true)]
    config: Vec<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write the JSON run report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Validate the configuration without running it
    #[arg(long)]
    check: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&cli);

    tracing::info!("Starting msgpipe");

    let config =
        TopologyConfig::load_all(cli.config.as_slice()).context("Failed to load topology")?;
    let registry = CodecRegistry::with_builtins();
    let topology = config
        .build(&registry)
        .context("Failed to build topology")?;

    if cli.check {
        tracing::info!(
            "Configuration OK: {} layers, {} steps",
            topology.layers().len(),
            topology.steps().len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let report = topology.run();

    if let Some(path) = &cli.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {:?}", path))?;
        tracing::info!("Report written to {:?}", path);
    }

    tracing::info!("Shutting down (exit code {})", report.exit_code());
    Ok(ExitCode::from(report.exit_code() as u8))
}

fn init_logging(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match &cli.log_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,msgpipe_rs=debug")),
    };

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "msgpipe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}
