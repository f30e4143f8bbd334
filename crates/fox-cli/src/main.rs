use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use fox_aggregate::{
    job_by_name, maybe_build_scheduler, CycleRunner, JobPlan, Orchestrator, PipelineConfig, RunMode,
};
use fox_ingest::{FileMonitor, Importer, IngestConfig, ReportKind};
use fox_storage::{Database, Warehouse};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fox-cli")]
#[command(about = "Manufacturing-test ETL: imports, aggregation jobs and the loops that run them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the embedded schema migrations.
    Migrate,
    /// Import one report file, or every workbook under a directory.
    Import {
        /// workstation, testboard or snfn
        kind: ReportKind,
        path: PathBuf,
        /// Remove each file once its rows are committed.
        #[arg(long)]
        delete: bool,
    },
    /// Watch the input directory for the portal's report files.
    Watch,
    /// Run one cycle of a plan, or a single job.
    Aggregate {
        #[arg(long, default_value = "recent")]
        mode: RunMode,
        #[arg(long)]
        job: Option<String>,
    },
    /// Repeat a plan forever, with an optional cron-driven full rebuild.
    Orchestrate {
        #[arg(long, default_value = "recent")]
        mode: RunMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Orchestrate {
        mode: RunMode::Recent,
    }) {
        Commands::Migrate => {
            let db = connect(&config).await?;
            db.migrate().await.context("applying migrations")?;
            println!("migrations applied to {}", config.db.describe());
        }
        Commands::Import { kind, path, delete } => {
            let db = connect(&config).await?;
            let importer = Importer::new(warehouse(&db));
            let report = importer
                .import_path(kind, &path)
                .await
                .with_context(|| format!("importing {}", path.display()))?;
            if delete {
                for done in &report.imported {
                    if let Err(err) = tokio::fs::remove_file(&done.file).await {
                        warn!(file = %done.file.display(), error = %err, "could not remove imported file")
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.failed.is_empty() {
                bail!(
                    "{} of {} files failed to import",
                    report.failed.len(),
                    report.failed.len() + report.imported.len()
                );
            }
        }
        Commands::Watch => {
            let ingest = IngestConfig::from_env();
            let db = connect(&config).await?;
            let monitor = FileMonitor::new(&ingest, Importer::new(warehouse(&db)));
            monitor.run(shutdown_channel()).await;
        }
        Commands::Aggregate { mode, job } => {
            let runner = cycle_runner(&config).await?;
            let plan = match job {
                Some(name) => JobPlan::single(job_by_name(&name)?, mode),
                None => JobPlan::for_mode(mode),
            };
            let report = runner.run_cycle(&plan, Local::now().date_naive()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(failed) = report.failed {
                bail!("job {} failed: {}", failed.job, failed.error);
            }
        }
        Commands::Orchestrate { mode } => {
            let runner = cycle_runner(&config).await?;
            let scheduler = if mode == RunMode::Recent {
                maybe_build_scheduler(config.full_rebuild_cron.as_deref(), runner.clone()).await?
            } else {
                None
            };
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(
                    cron = config.full_rebuild_cron.as_deref().unwrap_or_default(),
                    "full rebuild scheduled"
                );
            }
            let orchestrator =
                Orchestrator::new(runner, JobPlan::for_mode(mode), config.cycle_interval);
            orchestrator.run(shutdown_channel()).await;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
    }

    Ok(())
}

async fn connect(config: &PipelineConfig) -> Result<Database> {
    Database::connect(&config.db)
        .await
        .with_context(|| format!("connecting to {}", config.db.describe()))
}

fn warehouse(db: &Database) -> Arc<dyn Warehouse> {
    Arc::new(db.warehouse())
}

async fn cycle_runner(config: &PipelineConfig) -> Result<CycleRunner> {
    let rules = Arc::new(config.load_rules()?);
    let db = connect(config).await?;
    Ok(CycleRunner::new(warehouse(&db), rules, config.recent_days))
}

/// Flips to true on Ctrl+C or SIGTERM. Loops finish their current pass first.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, shutting down"),
            _ = terminate => info!("received terminate signal, shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}
