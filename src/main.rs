//! # paper-harvest CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest run-cycle --instance <name>` | Run one update cycle |
//! | `harvest resume --instance <name>` | Continue an interrupted cycle |
//! | `harvest status --instance <name>` | State, lock holder, last report, storage |
//! | `harvest instances` | Configured instances and their sources |
//! | `harvest storage --instance <name>` | Usage, projection, cleanup plan |
//! | `harvest schedule` | Run the current month for every instance |
//! | `harvest init-store` | Create the vector store schema |
//!
//! Cycle reports are printed as JSON on stdout; logs and progress go to
//! stderr. Exit codes: 0 success, 1 partial within tolerance, 2 fatal or
//! configuration error, 3 instance lock busy.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use paper_harvest::config::{self, Config};
use paper_harvest::error::{HarvestError, HarvestResult};
use paper_harvest::notify::{create_notifier, notify_cycle};
use paper_harvest::orchestrator::{setup_failure, Collaborators, CycleOptions, InstanceUpdateOrchestrator};
use paper_harvest::progress::{CycleProgressReporter, ProgressMode};
use paper_harvest::schedule::{install_cron, MonthlyScheduleRunner, PeriodOutcome};
use paper_harvest::status;
use paper_harvest::vector_store::SqliteVectorStore;
use paper_harvest_core::models::{CycleReport, EXIT_FATAL, EXIT_LOCK_BUSY, EXIT_SUCCESS};
use tokio_util::sync::CancellationToken;

/// paper-harvest: resumable ingestion of scientific papers into a vector store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "harvest", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off`
    /// otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one update cycle for an instance.
    ///
    /// Resumes the instance's interrupted cycle if there is one, otherwise
    /// starts the next. Prints the cycle report as JSON.
    RunCycle {
        #[arg(long)]
        instance: String,

        /// Forward at most this many unprocessed documents; the rest stay
        /// pending and the cycle stays resumable.
        #[arg(long)]
        max_items: Option<usize>,

        /// Discover and count only; nothing is downloaded or written.
        #[arg(long)]
        dry_run: bool,

        /// Give documents that failed in earlier cycles another attempt.
        #[arg(long)]
        retry_failed: bool,
    },

    /// Continue an interrupted cycle (warns and starts fresh if none).
    Resume {
        #[arg(long)]
        instance: String,

        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Show an instance's state, lock holder, last report, and storage.
    Status {
        #[arg(long)]
        instance: String,
    },

    /// List configured instances and their sources.
    Instances,

    /// Show storage usage, growth projection, and the cleanup plan.
    Storage {
        #[arg(long)]
        instance: String,

        /// Delete expired artifacts (requires `retention.auto_delete`).
        #[arg(long)]
        apply_retention: bool,
    },

    /// Run the current month for every instance, at most once per month.
    Schedule {
        /// Write `harvest.cron` for the configured cron expression instead
        /// of running.
        #[arg(long)]
        install: bool,

        /// Run even if this month already completed.
        #[arg(long)]
        force: bool,
    },

    /// Create the SQLite vector store and its schema. Idempotent.
    InitStore,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on Ctrl-C so running cycles flush and release their locks.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing current items");
            token.cancel();
        }
    });
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(2))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return exit(EXIT_FATAL);
        }
    };

    match run(cli, cfg).await {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli, cfg: Arc<Config>) -> anyhow::Result<i32> {
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::RunCycle {
            instance,
            max_items,
            dry_run,
            retry_failed,
        } => {
            let options = CycleOptions {
                max_items,
                dry_run,
                retry_failed: retry_failed.then_some(true),
                resume: false,
            };
            cancel_on_ctrl_c(cancel.clone());
            let report = run_one(&cfg, &instance, options, progress, cancel).await;
            deliver(&cfg, &report).await;
            print_json(&report)?;
            Ok(report.exit_code())
        }
        Commands::Resume {
            instance,
            max_items,
        } => {
            let options = CycleOptions {
                max_items,
                resume: true,
                ..CycleOptions::default()
            };
            cancel_on_ctrl_c(cancel.clone());
            let report = run_one(&cfg, &instance, options, progress, cancel).await;
            deliver(&cfg, &report).await;
            print_json(&report)?;
            Ok(report.exit_code())
        }
        Commands::Status { instance } => {
            status::run_status(&cfg, &instance).await?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Instances => {
            status::run_instances(&cfg)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Storage {
            instance,
            apply_retention,
        } => {
            status::run_storage(&cfg, &instance, apply_retention).await?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Schedule { install: true, .. } => {
            let exe = std::env::current_exe().context("Failed to locate the harvest binary")?;
            let config_path = std::fs::canonicalize(&cli.config).unwrap_or(cli.config.clone());
            let path = install_cron(&cfg, &exe, &config_path)?;
            println!("Wrote {}", path.display());
            println!("Install it with: crontab {}", path.display());
            Ok(EXIT_SUCCESS)
        }
        Commands::Schedule { force, .. } => {
            let notifier = create_notifier(&cfg.notify, &cfg.http)?;
            let runner = MonthlyScheduleRunner::new(cfg.clone(), notifier).with_progress(progress);
            cancel_on_ctrl_c(cancel.clone());
            match runner.run_period(chrono::Utc::now(), force, cancel).await? {
                PeriodOutcome::Ran(report) => {
                    print_json(&report)?;
                    Ok(report.exit_code())
                }
                PeriodOutcome::AlreadyRan { period } => {
                    eprintln!("Period {} already completed; use --force to run again.", period);
                    Ok(EXIT_SUCCESS)
                }
                PeriodOutcome::Busy => {
                    eprintln!("Another schedule run is in progress.");
                    Ok(EXIT_LOCK_BUSY)
                }
            }
        }
        Commands::InitStore => {
            let path = cfg.vector_store_path();
            let store = SqliteVectorStore::open(&path).await?;
            store.close().await;
            println!("Vector store initialized at {}", path.display());
            Ok(EXIT_SUCCESS)
        }
    }
}

async fn build_orchestrator(
    cfg: &Arc<Config>,
    name: &str,
) -> HarvestResult<InstanceUpdateOrchestrator> {
    let instance = cfg
        .instance(name)
        .map_err(|e| HarvestError::Configuration(format!("{:#}", e)))?;
    let collaborators = Collaborators::from_config(cfg, instance).await?;
    InstanceUpdateOrchestrator::new(cfg.clone(), name, collaborators)
}

/// Hand a single cycle's report to the notifier per `notify.on_cycle`.
async fn deliver(cfg: &Config, report: &CycleReport) {
    match create_notifier(&cfg.notify, &cfg.http) {
        Ok(notifier) => {
            notify_cycle(notifier.as_ref(), &cfg.notify, report).await;
        }
        Err(e) => tracing::warn!(error = %e, "cannot build notifier"),
    }
}

async fn run_one(
    cfg: &Arc<Config>,
    name: &str,
    options: CycleOptions,
    progress: Arc<dyn CycleProgressReporter>,
    cancel: CancellationToken,
) -> CycleReport {
    match build_orchestrator(cfg, name).await {
        Ok(orchestrator) => {
            orchestrator
                .with_progress(progress)
                .run_cycle(options, cancel)
                .await
        }
        Err(e) => {
            tracing::error!(instance = name, error = %e, "cannot set up instance");
            setup_failure(name, &e)
        }
    }
}
