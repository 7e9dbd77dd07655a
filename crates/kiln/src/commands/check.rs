//! Check command - load, validate and summarize the application config.

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use kiln_core::CronJob;
use serde::Serialize;

use super::Context;

/// Arguments for the check command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Also print the merged configuration as TOML
    #[arg(long)]
    pub show: bool,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    name: String,
    valid: bool,
    error: Option<String>,
    sources: Vec<SourceOutput>,
    warnings: Vec<String>,
    min_threads: usize,
    max_threads: usize,
    scheduler_enabled: bool,
    prototypes: usize,
    cron: Vec<CronOutput>,
}

#[derive(Debug, Serialize)]
struct SourceOutput {
    path: String,
    loaded: bool,
}

#[derive(Debug, Serialize)]
struct CronOutput {
    name: String,
    function: Option<String>,
    error: Option<String>,
}

/// Run the check command. Fails if the configuration does not validate.
pub fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.loaded.config;
    let error = config.validate().err().map(|e| e.to_string());
    let evaluators = config.evaluators();

    let output = CheckOutput {
        name: config.app_name().to_string(),
        valid: error.is_none(),
        error: error.clone(),
        sources: ctx
            .loaded
            .sources
            .iter()
            .map(|s| SourceOutput {
                path: s.path.display().to_string(),
                loaded: s.loaded,
            })
            .collect(),
        warnings: ctx.loaded.warnings.clone(),
        min_threads: evaluators.min_threads,
        max_threads: evaluators.max_threads,
        scheduler_enabled: config.scheduler().enabled,
        prototypes: config.prototypes.len(),
        cron: config
            .cron
            .iter()
            .map(|(name, entry)| CronOutput {
                name: name.clone(),
                function: entry.function.clone(),
                error: CronJob::from_config(name, entry).err().map(|e| e.to_string()),
            })
            .collect(),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&output);
        if args.show {
            println!("---\nMerged config:\n");
            println!("{}", config.to_toml()?);
        }
    }

    if let Some(error) = error {
        bail!("invalid configuration: {error}");
    }
    Ok(())
}

fn print_summary(output: &CheckOutput) {
    let green = Style::new().green();
    let red = Style::new().red();
    let dim = Style::new().dim();

    println!();
    println!("{}", style(format!("Application {}", output.name)).bold());
    println!("{}", dim.apply_to("─".repeat(40)));

    for source in &output.sources {
        let status = if source.loaded {
            green.apply_to("✓ loaded")
        } else {
            dim.apply_to("· not found")
        };
        println!("  {} {}", status, source.path);
    }
    println!();

    println!(
        "  {} {}..{}",
        dim.apply_to("Evaluators:"),
        output.min_threads,
        output.max_threads
    );
    println!(
        "  {} {}",
        dim.apply_to("Scheduler:"),
        if output.scheduler_enabled { "enabled" } else { "disabled" }
    );
    println!("  {} {}", dim.apply_to("Prototypes:"), output.prototypes);

    if !output.cron.is_empty() {
        println!();
        println!("  Cron jobs:");
        for job in &output.cron {
            match &job.error {
                None => println!(
                    "    {:<16} {}",
                    job.name,
                    job.function.as_deref().unwrap_or("-")
                ),
                Some(e) => println!("    {:<16} {}", job.name, red.apply_to(e)),
            }
        }
    }

    if !output.warnings.is_empty() {
        println!();
        println!("  Warnings:");
        for w in &output.warnings {
            println!("    ⚠ {w}");
        }
    }

    println!();
    match &output.error {
        None => println!("  {}", green.apply_to("● configuration is valid")),
        Some(e) => println!("  {} {}", red.apply_to("● invalid:"), e),
    }
    println!();
}
