use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use autoperf::config::AutoperfConfig;
use autoperf::report::{render, ExportFormat, ExportKind, ReportGenerator};
use autoperf::{exec, logging, MetricsStore, SessionSlot};

#[derive(Parser)]
#[command(
    name = "autoperf",
    about = "Performance metrics for scripted browser automation",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $AUTOPERF_CONFIG, then ./autoperf.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Metrics store path, overriding config and AUTOPERF_DB
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the metrics store if needed and print its path
    Init,

    /// List recent runs, newest first
    Runs {
        /// Look-back window in days
        #[arg(long)]
        days: Option<u32>,

        /// Only runs of this script
        #[arg(long)]
        script: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Aggregate statistics over recent runs
    Summary {
        /// Look-back window in days
        #[arg(long)]
        days: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Chronological step breakdown of one run (latest if omitted)
    Detail {
        run_id: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Steps whose mean duration exceeds a threshold
    Bottlenecks {
        /// Look-back window in days
        #[arg(long)]
        days: Option<u32>,

        /// Threshold in seconds
        #[arg(long)]
        min_duration: Option<f64>,

        /// Only runs of this script
        #[arg(long)]
        script: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Daily and per-step trends for one script
    Trends {
        #[arg(long)]
        script: String,

        /// Look-back window in days
        #[arg(long)]
        days: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Write a summary (or one run's detail) to a file
    Export {
        /// Output file path
        #[arg(long)]
        output: PathBuf,

        /// text or json
        #[arg(long, default_value = "text")]
        format: ExportFormat,

        /// Look-back window in days for the summary
        #[arg(long)]
        days: Option<u32>,

        /// Export this run's detail instead of a summary
        #[arg(long)]
        run: Option<String>,
    },

    /// Run an automation command and record it as a run
    Exec {
        /// Script name the run is filed under
        #[arg(long)]
        script: String,

        #[arg(long)]
        environment: Option<String>,

        #[arg(long)]
        browser: Option<String>,

        /// Free-form tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        notes: Option<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Config warnings are emitted before the configured subscriber exists.
    let mut config = logging::bootstrap(|| AutoperfConfig::resolve(cli.config.as_deref()))
        .context("loading configuration")?;
    if let Some(db) = cli.db {
        config.store.path = db;
    }
    logging::init(&config.logging);

    let store = MetricsStore::open(&config.store.path)
        .with_context(|| format!("opening metrics store {}", config.store.path.display()))?;
    let reports = ReportGenerator::new(store.clone());
    let defaults = &config.report;

    match cli.command {
        Commands::Init => {
            tracing::info!(path = %store.path().display(), "metrics store ready");
            println!("{}", store.path().display());
        }
        Commands::Runs { days, script, json } => {
            let runs = reports.recent_runs(days.unwrap_or(defaults.default_days), script.as_deref())?;
            if json {
                print_json(&runs)?;
            } else {
                print!("{}", render::run_list(&runs));
            }
        }
        Commands::Summary { days, json } => {
            let days = days.unwrap_or(defaults.default_days);
            if json {
                print_json(&reports.summarize(days)?)?;
            } else {
                print!("{}", reports.summary(days)?);
            }
        }
        Commands::Detail { run_id, json } => {
            if json {
                print_json(&reports.run_detail(run_id.as_deref())?)?;
            } else {
                print!("{}", reports.detail(run_id.as_deref())?);
            }
        }
        Commands::Bottlenecks {
            days,
            min_duration,
            script,
            json,
        } => {
            let min_duration = min_duration.unwrap_or(defaults.bottleneck_threshold_secs);
            let found = reports.bottlenecks(
                days.unwrap_or(defaults.default_days),
                min_duration,
                script.as_deref(),
            )?;
            if json {
                print_json(&found)?;
            } else {
                print!("{}", render::bottlenecks(&found, min_duration));
            }
        }
        Commands::Trends { script, days, json } => {
            let trends = reports.trends(&script, days.unwrap_or(defaults.trend_days))?;
            if json {
                print_json(&trends)?;
            } else {
                print!("{}", render::trends(&trends));
            }
        }
        Commands::Export {
            output,
            format,
            days,
            run,
        } => {
            let kind = match run {
                Some(run_id) => ExportKind::Detail { run_id: Some(run_id) },
                None => ExportKind::Summary {
                    days: days.unwrap_or(defaults.default_days),
                    min_duration: defaults.bottleneck_threshold_secs,
                },
            };
            reports.export(&output, &kind, format)?;
            println!("Report written to {}", output.display());
        }
        Commands::Exec {
            script,
            environment,
            browser,
            tags,
            notes,
            command,
        } => {
            let mut metadata = config.run_metadata(script);
            if let Some(environment) = environment {
                metadata = metadata.environment(environment);
            }
            if let Some(browser) = browser {
                metadata = metadata.browser(browser);
            }
            for tag in tags {
                metadata = metadata.tag(tag);
            }
            if let Some(notes) = notes {
                metadata = metadata.notes(notes);
            }

            let slot = SessionSlot::new(store);
            let outcome = exec::run(&slot, metadata, &command)?;
            if let Some(run_id) = &outcome.run_id {
                eprintln!("Recorded run {} (exit code {})", run_id, outcome.exit_code);
            }
            return Ok(ExitCode::from(u8::try_from(outcome.exit_code).unwrap_or(1)));
        }
    }

    Ok(ExitCode::SUCCESS)
}
