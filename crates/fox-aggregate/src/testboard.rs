//! Testboard summaries: station and fixture performance, and the distinct
//! failure occurrences behind the SNFN dashboard.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use fox_core::{
    derive_error_code, round_to, AggregationRules, FixturePerformanceRow, NaturalKey,
    SnfnAggregateRow, StationPerformanceRow, TestboardRecord,
};
use fox_storage::SummaryBatch;
use tracing::debug;

use crate::{window, AggregationJob, JobCategory, JobContext, JobError, JobStats};

/// Pass, fail and total for one group. Statuses that are neither still count
/// toward the total.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PassFail {
    pub pass: i64,
    pub fail: i64,
    pub total: i64,
}

impl PassFail {
    fn record(&mut self, rules: &AggregationRules, status: Option<&str>) {
        self.total += 1;
        if rules.status.is_pass(status) {
            self.pass += 1;
        }
        if rules.status.is_fail(status, rules.testboard_fail_rule) {
            self.fail += 1;
        }
    }
}

pub struct StationPerformance;

#[async_trait]
impl AggregationJob for StationPerformance {
    fn name(&self) -> &'static str {
        "station_performance"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Testboard
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let mut groups: BTreeMap<(NaiveDate, String, String, String), PassFail> = BTreeMap::new();
        let mut incomplete = 0u64;

        let scanned = ctx
            .warehouse
            .scan_testboard(window::daily(ctx), &mut |r: TestboardRecord| {
                let (Some(model), Some(process)) = (r.model, r.work_station_process) else {
                    incomplete += 1;
                    return;
                };
                groups
                    .entry((r.history_station_end_time.date(), model, process, r.workstation_name))
                    .or_default()
                    .record(rules, r.history_station_passing_status.as_deref());
            })
            .await?;
        if incomplete > 0 {
            debug!(incomplete, "testboard rows without model or process left out");
        }

        let rows: Vec<StationPerformanceRow> = groups
            .into_iter()
            .map(|((end_date, model, work_station_process, workstation_name), c)| StationPerformanceRow {
                end_date,
                model,
                work_station_process,
                workstation_name,
                pass: c.pass,
                fail: c.fail,
                total: c.total,
                failurerate: round_to(c.fail as f64 / c.total as f64, 3),
            })
            .collect();

        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::StationPerformance(rows)).await?);
        Ok(stats)
    }
}

pub struct FixturePerformance;

#[async_trait]
impl AggregationJob for FixturePerformance {
    fn name(&self) -> &'static str {
        "fixture_performance"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Testboard
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let mut groups: BTreeMap<(NaiveDate, String, String, String, String), PassFail> =
            BTreeMap::new();
        let mut incomplete = 0u64;

        let scanned = ctx
            .warehouse
            .scan_testboard(window::daily(ctx), &mut |r: TestboardRecord| {
                let (Some(fixture), Some(model), Some(pn)) = (r.fixture_no, r.model, r.pn) else {
                    incomplete += 1;
                    return;
                };
                groups
                    .entry((r.history_station_end_time.date(), fixture, model, pn, r.workstation_name))
                    .or_default()
                    .record(rules, r.history_station_passing_status.as_deref());
            })
            .await?;
        if incomplete > 0 {
            debug!(incomplete, "testboard rows without fixture, model or pn left out");
        }

        let rows = groups
            .into_iter()
            .map(|((day, fixture_no, model, pn, workstation_name), c)| FixturePerformanceRow {
                day,
                fixture_no,
                model,
                pn,
                workstation_name,
                pass: c.pass,
                fail: c.fail,
                total: c.total,
            })
            .collect();

        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::FixturePerformance(rows)).await?);
        Ok(stats)
    }
}

/// One row per distinct failing testboard event. The error code is derived
/// from the failure reason text.
pub struct SnfnReports;

#[async_trait]
impl AggregationJob for SnfnReports {
    fn name(&self) -> &'static str {
        "snfn_reports"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Testboard
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let mut occurrences: BTreeMap<String, SnfnAggregateRow> = BTreeMap::new();

        let scanned = ctx
            .warehouse
            .scan_testboard(window::daily(ctx), &mut |r: TestboardRecord| {
                let status = r.history_station_passing_status.as_deref();
                if !rules.status.is_fail(status, rules.testboard_fail_rule) {
                    return;
                }
                let (Some(fixture_no), Some(model)) = (r.fixture_no, r.model) else {
                    return;
                };
                let row = SnfnAggregateRow {
                    error_code: derive_error_code(r.failure_reasons.as_deref()),
                    error_disc: r.failure_note,
                    fixture_no,
                    workstation_name: r.workstation_name,
                    sn: r.sn,
                    pn: r.pn,
                    model,
                    history_station_end_time: r.history_station_end_time,
                };
                occurrences.insert(row.natural_key(), row);
            })
            .await?;

        let rows: Vec<SnfnAggregateRow> = occurrences.into_values().collect();
        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::SnfnAggregate(rows)).await?);
        Ok(stats)
    }
}
