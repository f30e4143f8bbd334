//! Aggregation jobs over the raw logs, the ordered plans that run them, and
//! the loop that repeats a plan until shutdown.
//!
//! Every job is a pure function of the raw tables and the run window: it scans,
//! groups in memory, and hands the grouped rows to the warehouse in one batch.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use fox_core::AggregationRules;
use fox_storage::{DbConfig, ErrorClass, StoreError, SummaryBatch, Warehouse, WriteMode, WriteOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod pipeline;
pub mod testboard;
pub mod throughput;
pub mod window;
pub mod workstation;

pub use pipeline::{
    all_jobs, job_by_name, maybe_build_scheduler, run_job, CycleReport, CycleRunner, FailedJob,
    JobPlan, Orchestrator,
};
pub use testboard::{FixturePerformance, SnfnReports, StationPerformance};
pub use throughput::{TpyDaily, TpyWeekly};
pub use workstation::{PackingDaily, PchartDaily, SortTestDaily, StationHourlyCounts};

pub const CRATE_NAME: &str = "fox-aggregate";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown job `{0}`")]
    UnknownJob(String),
}

impl JobError {
    pub fn class(&self) -> ErrorClass {
        match self {
            JobError::Store(err) => err.class(),
            JobError::UnknownJob(_) => ErrorClass::Data,
        }
    }
}

/// `Recent` upserts over a trailing window; `Full` truncates and rebuilds
/// from the whole history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Recent,
    Full,
}

impl RunMode {
    pub fn write_mode(&self) -> WriteMode {
        match self {
            RunMode::Recent => WriteMode::Upsert,
            RunMode::Full => WriteMode::Replace,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Recent => "recent",
            RunMode::Full => "full",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recent" | "daily" => Ok(RunMode::Recent),
            "full" | "all_time" | "historical" => Ok(RunMode::Full),
            other => Err(format!("unknown run mode `{other}` (expected recent or full)")),
        }
    }
}

/// Jobs run in category order; throughput reads tables the other two fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    Testboard,
    Workstation,
    Throughput,
}

#[derive(Clone)]
pub struct JobContext {
    pub warehouse: Arc<dyn Warehouse>,
    pub rules: Arc<AggregationRules>,
    pub mode: RunMode,
    pub today: NaiveDate,
    /// Length of the recent window in days, today included.
    pub recent_days: u32,
}

impl JobContext {
    pub fn write_mode(&self) -> WriteMode {
        self.mode.write_mode()
    }

    pub(crate) async fn write(&self, batch: SummaryBatch) -> Result<WriteOutcome, StoreError> {
        self.warehouse.write_summaries(batch, self.write_mode()).await
    }
}

/// Counters a job hands back to the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub scanned: u64,
    pub written: u64,
    pub skipped: u64,
}

impl JobStats {
    pub(crate) fn add_write(&mut self, outcome: WriteOutcome) {
        self.written += outcome.written;
        self.skipped += outcome.skipped;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: &'static str,
    pub category: JobCategory,
    pub mode: RunMode,
    pub stats: JobStats,
    pub duration_ms: u128,
}

#[async_trait]
pub trait AggregationJob: Send + Sync {
    fn name(&self) -> &'static str;
    fn category(&self) -> JobCategory;
    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db: DbConfig,
    pub cycle_interval: Duration,
    pub recent_days: u32,
    pub full_rebuild_cron: Option<String>,
    pub rules_path: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::from_env(),
            cycle_interval: Duration::from_secs(
                std::env::var("FOX_CYCLE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(120),
            ),
            recent_days: std::env::var("FOX_RECENT_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|days| *days > 0)
                .unwrap_or(7),
            full_rebuild_cron: std::env::var("FOX_FULL_REBUILD_CRON")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            rules_path: std::env::var("FOX_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rules/aggregation.yaml")),
        }
    }

    pub fn load_rules(&self) -> Result<AggregationRules> {
        AggregationRules::load(&self.rules_path)
            .with_context(|| format!("loading aggregation rules from {}", self.rules_path.display()))
    }
}
