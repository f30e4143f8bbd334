//! Job plans, the cycle runner and the orchestration loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use fox_core::AggregationRules;
use fox_storage::{ErrorClass, Warehouse};
use serde::Serialize;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    AggregationJob, FixturePerformance, JobContext, JobError, JobReport, PackingDaily, PchartDaily,
    RunMode, SnfnReports, SortTestDaily, StationHourlyCounts, StationPerformance, TpyDaily,
    TpyWeekly,
};

/// Every job in run order: testboard, then workstation, then throughput.
pub fn all_jobs() -> Vec<Arc<dyn AggregationJob>> {
    let jobs: [Arc<dyn AggregationJob>; 9] = [
        Arc::new(StationPerformance),
        Arc::new(FixturePerformance),
        Arc::new(SnfnReports),
        Arc::new(PackingDaily),
        Arc::new(PchartDaily),
        Arc::new(StationHourlyCounts),
        Arc::new(SortTestDaily),
        Arc::new(TpyDaily),
        Arc::new(TpyWeekly),
    ];
    jobs.into()
}

pub fn job_by_name(name: &str) -> Result<Arc<dyn AggregationJob>, JobError> {
    all_jobs()
        .into_iter()
        .find(|job| job.name() == name)
        .ok_or_else(|| JobError::UnknownJob(name.to_string()))
}

#[derive(Clone)]
pub struct JobPlan {
    pub name: &'static str,
    pub mode: RunMode,
    jobs: Vec<Arc<dyn AggregationJob>>,
}

impl JobPlan {
    /// Trailing-window upserts, run every cycle.
    pub fn recent() -> Self {
        Self::new("recent", RunMode::Recent, all_jobs())
    }

    /// Truncate-and-rebuild over all history.
    pub fn historical() -> Self {
        Self::new("historical", RunMode::Full, all_jobs())
    }

    /// Jobs are kept in category order whatever order they arrive in.
    pub fn new(name: &'static str, mode: RunMode, mut jobs: Vec<Arc<dyn AggregationJob>>) -> Self {
        jobs.sort_by_key(|job| job.category());
        Self { name, mode, jobs }
    }

    pub fn single(job: Arc<dyn AggregationJob>, mode: RunMode) -> Self {
        Self::new("single", mode, vec![job])
    }

    pub fn for_mode(mode: RunMode) -> Self {
        match mode {
            RunMode::Recent => Self::recent(),
            RunMode::Full => Self::historical(),
        }
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }
}

/// Runs one job with timing and logging around it.
pub async fn run_job(job: &dyn AggregationJob, ctx: &JobContext) -> Result<JobReport, JobError> {
    let span = info_span!("job", job = job.name(), mode = %ctx.mode);
    async {
        let started = Instant::now();
        info!("job started");
        let stats = job.run(ctx).await?;
        let report = JobReport {
            job: job.name(),
            category: job.category(),
            mode: ctx.mode,
            stats,
            duration_ms: started.elapsed().as_millis(),
        };
        info!(
            scanned = stats.scanned,
            written = stats.written,
            skipped = stats.skipped,
            duration_ms = report.duration_ms as u64,
            "job finished"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub job: &'static str,
    pub class: ErrorClass,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub plan: &'static str,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed: Vec<JobReport>,
    pub failed: Option<FailedJob>,
    /// Jobs not attempted because an earlier one failed.
    pub skipped: Vec<&'static str>,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        self.failed.is_none()
    }
}

#[derive(Clone)]
pub struct CycleRunner {
    warehouse: Arc<dyn Warehouse>,
    rules: Arc<AggregationRules>,
    recent_days: u32,
}

impl CycleRunner {
    pub fn new(warehouse: Arc<dyn Warehouse>, rules: Arc<AggregationRules>, recent_days: u32) -> Self {
        Self {
            warehouse,
            rules,
            recent_days,
        }
    }

    pub fn context(&self, mode: RunMode, today: NaiveDate) -> JobContext {
        JobContext {
            warehouse: self.warehouse.clone(),
            rules: self.rules.clone(),
            mode,
            today,
            recent_days: self.recent_days,
        }
    }

    /// Runs the plan's jobs in order. The first failure ends the cycle; the
    /// jobs after it are reported as skipped.
    pub async fn run_cycle(&self, plan: &JobPlan, today: NaiveDate) -> CycleReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", plan = plan.name, %run_id);
        async {
            let ctx = self.context(plan.mode, today);
            let started_at = Utc::now();
            let mut completed = Vec::with_capacity(plan.jobs.len());
            let mut failed = None;
            let mut skipped = Vec::new();

            for job in &plan.jobs {
                if failed.is_some() {
                    skipped.push(job.name());
                    continue;
                }
                match run_job(job.as_ref(), &ctx).await {
                    Ok(report) => completed.push(report),
                    Err(err) => {
                        let class = err.class();
                        error!(job = job.name(), ?class, error = %err, "job failed; aborting cycle");
                        failed = Some(FailedJob {
                            job: job.name(),
                            class,
                            error: err.to_string(),
                        });
                    }
                }
            }

            let report = CycleReport {
                run_id,
                plan: plan.name,
                mode: plan.mode,
                started_at,
                finished_at: Utc::now(),
                completed,
                failed,
                skipped,
            };
            if report.succeeded() {
                info!(jobs = report.completed.len(), "cycle complete");
            } else {
                warn!(
                    completed = report.completed.len(),
                    skipped = report.skipped.len(),
                    "cycle aborted"
                );
            }
            report
        }
        .instrument(span)
        .await
    }
}

/// Repeats one plan with a fixed pause between cycles.
pub struct Orchestrator {
    runner: CycleRunner,
    plan: JobPlan,
    interval: Duration,
}

impl Orchestrator {
    pub fn new(runner: CycleRunner, plan: JobPlan, interval: Duration) -> Self {
        Self {
            runner,
            plan,
            interval,
        }
    }

    /// Each cycle runs on its own task so a panic in one is logged and the
    /// loop carries on after the usual pause. Returns after `shutdown` flips
    /// to true or its sender goes away; a cycle in flight is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            plan = self.plan.name,
            interval_secs = self.interval.as_secs(),
            jobs = ?self.plan.job_names(),
            "orchestrator started"
        );
        let mut cycles = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }
            cycles += 1;
            let runner = self.runner.clone();
            let plan = self.plan.clone();
            let today = Local::now().date_naive();
            let handle = tokio::spawn(async move { runner.run_cycle(&plan, today).await });
            match handle.await {
                Ok(report) if report.succeeded() => {}
                Ok(report) => {
                    if let Some(failed) = &report.failed {
                        warn!(cycle = cycles, job = failed.job, "cycle ended early; retrying after the pause");
                    }
                }
                Err(err) => error!(cycle = cycles, error = %err, "cycle bookkeeping failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(cycles, "orchestrator stopped");
    }
}

/// A cron-driven full rebuild alongside the recent loop, when configured.
pub async fn maybe_build_scheduler(cron: Option<&str>, runner: CycleRunner) -> Result<Option<JobScheduler>> {
    let Some(cron) = cron else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            let report = runner
                .run_cycle(&JobPlan::historical(), Local::now().date_naive())
                .await;
            info!(run_id = %report.run_id, succeeded = report.succeeded(), "scheduled full rebuild finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, day, seed_testboard, seed_workstation, tb, ws};
    use crate::JobCategory;
    use fox_storage::{tables, MemoryWarehouse};

    fn runner(warehouse: Arc<MemoryWarehouse>) -> CycleRunner {
        CycleRunner::new(warehouse, Arc::new(AggregationRules::default()), 7)
    }

    async fn seeded() -> Arc<MemoryWarehouse> {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(
            &warehouse,
            vec![
                ws("A", "Tesla SXM5", "FI", at(2025, 1, 6, 8), "Pass"),
                ws("A", "Tesla SXM5", "PACKING", at(2025, 1, 6, 10), "Pass"),
            ],
        )
        .await;
        seed_testboard(&warehouse, vec![tb("B", "F1", at(2025, 1, 6, 9), "Fail", Some("E12"))]).await;
        warehouse
    }

    #[test]
    fn plans_run_categories_in_dependency_order() {
        let jobs: Vec<Arc<dyn AggregationJob>> =
            vec![Arc::new(TpyWeekly), Arc::new(PackingDaily), Arc::new(SnfnReports)];
        let plan = JobPlan::new("mixed", RunMode::Recent, jobs);
        assert_eq!(plan.job_names(), vec!["snfn_reports", "packing_daily", "tpy_weekly"]);

        let categories: Vec<JobCategory> = JobPlan::historical().jobs.iter().map(|j| j.category()).collect();
        let mut sorted = categories.clone();
        sorted.sort();
        assert_eq!(categories, sorted);
        assert_eq!(JobPlan::recent().job_names().len(), 9);
    }

    #[test]
    fn jobs_resolve_by_name() {
        assert_eq!(job_by_name("tpy_daily").unwrap().name(), "tpy_daily");
        assert!(matches!(job_by_name("nope"), Err(JobError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn a_full_cycle_fills_every_table() {
        let warehouse = seeded().await;
        let report = runner(warehouse.clone())
            .run_cycle(&JobPlan::historical(), day(2025, 1, 8))
            .await;
        assert!(report.succeeded());
        assert_eq!(report.completed.len(), 9);
        for table in [
            tables::STATION_PERFORMANCE,
            tables::SNFN_AGGREGATE,
            tables::PACKING_DAILY,
            tables::STATION_HOURLY,
            tables::DAILY_TPY,
            tables::WEEKLY_TPY,
        ] {
            assert!(!warehouse.summary_snapshot(table).await.is_empty(), "{table} is empty");
        }
    }

    #[tokio::test]
    async fn a_failed_job_aborts_the_rest_of_the_cycle() {
        let warehouse = seeded().await;
        warehouse.mark_unavailable(tables::PACKING_DAILY).await;
        let report = runner(warehouse.clone())
            .run_cycle(&JobPlan::recent(), day(2025, 1, 8))
            .await;

        let failed = report.failed.as_ref().unwrap();
        assert_eq!(failed.job, "packing_daily");
        assert_eq!(failed.class, ErrorClass::Transient);
        assert_eq!(report.completed.len(), 3);
        assert_eq!(
            report.skipped,
            vec!["pchart_daily", "station_hourly_counts", "sort_test_daily", "tpy_daily", "tpy_weekly"]
        );
        assert!(warehouse.summary_snapshot(tables::DAILY_TPY).await.is_empty());

        warehouse.mark_available(tables::PACKING_DAILY).await;
        let retry = runner(warehouse.clone())
            .run_cycle(&JobPlan::recent(), day(2025, 1, 8))
            .await;
        assert!(retry.succeeded());
    }

    #[tokio::test]
    async fn rejected_rows_are_skipped_without_failing_the_job() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(
            &warehouse,
            vec![
                ws("A", "Tesla SXM5", "FI", at(2025, 1, 6, 8), "Pass"),
                ws("B", "Tesla SXM5", "FI", at(2025, 1, 6, 9), "Pass"),
            ],
        )
        .await;
        warehouse
            .reject_row(tables::STATION_HOURLY, "2025-01-06\u{1f}09\u{1f}FI")
            .await;
        let ctx = runner(warehouse.clone()).context(RunMode::Full, day(2025, 1, 6));
        let report = run_job(&StationHourlyCounts, &ctx).await.unwrap();
        assert_eq!(report.stats.written, 1);
        assert_eq!(report.stats.skipped, 1);
    }

    #[tokio::test]
    async fn orchestrator_stops_on_shutdown() {
        let orchestrator = Orchestrator::new(
            runner(seeded().await),
            JobPlan::recent(),
            Duration::from_secs(3600),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { orchestrator.run(rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
