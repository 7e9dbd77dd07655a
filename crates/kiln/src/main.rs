//! Kiln - application server core
//!
//! Main entry point for the Kiln CLI.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

mod commands;

use commands::{check, cron, render};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Kiln - application server core
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Application directory holding kiln.toml
    #[arg(long, global = true, env = "KILN_APP_DIR", default_value = ".")]
    pub app_dir: PathBuf,

    /// User config directory (default: platform config dir)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the application configuration
    Check(check::CheckArgs),

    /// List cron jobs and whether they run at a given time
    Cron(cron::CronArgs),

    /// Render a skin file with the in-memory engine
    Render(render::RenderArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded =
        kiln_config::load_config_with_options(Some(&cli.app_dir), cli.config_dir.as_deref())?;

    // Initialize tracing: console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "kiln=debug,kiln_core=debug,kiln_config=debug,kiln_session=debug,info"
    } else {
        "kiln=info,kiln_core=info,kiln_config=warn,kiln_session=warn,warn"
    };

    let log_dir = log_dir(&cli.app_dir, loaded.config.logging().directory.as_deref());
    let file_appender = tracing_appender::rolling::daily(&log_dir, "kiln.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "kiln=trace,kiln_core=trace,kiln_config=trace,kiln_session=trace,info",
                )),
        )
        .init();

    for warning in &loaded.warnings {
        warn!(%warning, "Configuration warning");
    }

    let ctx = commands::Context {
        app_dir: cli.app_dir,
        loaded,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Check(args) => check::run(args, &ctx),
        Commands::Cron(args) => cron::run(args, &ctx),
        Commands::Render(args) => render::run(args, &ctx),
    }
}

/// Where the JSON log goes: the configured directory (relative to the
/// application), else `logs` under the user config dir.
fn log_dir(app_dir: &Path, configured: Option<&Path>) -> PathBuf {
    match configured {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => app_dir.join(dir),
        None => kiln_config::config_dir()
            .map(|d| d.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs")),
    }
}
