//! Cron command - show which configured jobs run at a given time.

use anyhow::{Context as _, Result};
use chrono::{DateTime, FixedOffset, Local};
use clap::Args;
use console::Style;
use kiln_core::{CronJob, millis_to_next_full_minute};
use serde::Serialize;

use super::Context;

/// Arguments for the cron command.
#[derive(Args, Debug)]
pub struct CronArgs {
    /// Instant to test, RFC 3339 (default: now)
    #[arg(long)]
    pub at: Option<String>,

    /// List every job, not only the ones that apply
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
struct JobOutput {
    name: String,
    function: String,
    timeout_secs: u64,
    applies: bool,
}

#[derive(Debug, Serialize)]
struct CronOutput {
    at: String,
    millis_to_next_minute: u64,
    jobs: Vec<JobOutput>,
}

/// Run the cron command.
pub fn run(args: CronArgs, ctx: &Context) -> Result<()> {
    let at: DateTime<FixedOffset> = match &args.at {
        Some(text) => DateTime::parse_from_rfc3339(text)
            .with_context(|| format!("invalid --at time: {text}"))?,
        None => Local::now().fixed_offset(),
    };

    let jobs: Vec<JobOutput> = CronJob::parse_all(&ctx.loaded.config.cron)
        .into_iter()
        .map(|job| JobOutput {
            name: job.name().to_string(),
            function: job.function().to_string(),
            timeout_secs: job.timeout().as_secs(),
            applies: job.applies_to(&at),
        })
        .filter(|job| args.all || job.applies)
        .collect();

    let output = CronOutput {
        at: at.to_rfc3339(),
        millis_to_next_minute: millis_to_next_full_minute(at.timestamp_millis()),
        jobs,
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    let green = Style::new().green();
    println!("{} {}", dim.apply_to("At:"), output.at);
    if output.jobs.is_empty() {
        println!("No cron jobs apply");
        return Ok(());
    }
    for job in &output.jobs {
        let marker = if job.applies {
            green.apply_to("●")
        } else {
            dim.apply_to("·")
        };
        println!(
            "  {} {:<16} {:<20} {}",
            marker,
            job.name,
            job.function,
            dim.apply_to(format!("{}s", job.timeout_secs))
        );
    }
    if ctx.verbose {
        println!(
            "{} {}ms",
            dim.apply_to("Next tick in:"),
            output.millis_to_next_minute
        );
    }
    Ok(())
}
