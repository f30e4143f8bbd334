//! Workstation summaries: packing output, p-chart counts, hourly station
//! load and sort-test throughput.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Timelike};
use fox_core::{
    shift_weekend_to_friday, PackingDailyRow, PchartDailyRow, SortTestDailyRow, StationHourlyRow,
    WorkstationRecord,
};
use fox_storage::SummaryBatch;
use tracing::{debug, warn};

use crate::{window, AggregationJob, JobCategory, JobContext, JobError, JobStats};

/// Passing events at the terminal station, weekend output credited to Friday.
pub struct PackingDaily;

#[async_trait]
impl AggregationJob for PackingDaily {
    fn name(&self) -> &'static str {
        "packing_daily"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Workstation
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let mut counts: BTreeMap<(NaiveDate, String, String), i64> = BTreeMap::new();

        let scanned = ctx
            .warehouse
            .scan_workstation(window::weekend_folded(ctx), &mut |r: WorkstationRecord| {
                if !rules.is_terminal(&r.workstation_name)
                    || !rules.status.is_pass(r.history_station_passing_status.as_deref())
                {
                    return;
                }
                let (Some(model), Some(pn)) = (r.model, r.pn) else {
                    return;
                };
                let pack_date = shift_weekend_to_friday(r.history_station_end_time.date());
                *counts.entry((pack_date, model, pn)).or_default() += 1;
            })
            .await?;

        let rows = counts
            .into_iter()
            .map(|((pack_date, model, part_number), packed_count)| PackingDailyRow {
                pack_date,
                model,
                part_number,
                packed_count,
            })
            .collect();
        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::PackingDaily(rows)).await?);
        Ok(stats)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PchartCounts {
    total: i64,
    pass: i64,
    fail: i64,
}

/// Daily pass/fail per part number, station and service flow, noise flows
/// excluded. Writes `workstation_pchart_daily`.
pub struct PchartDaily;

#[async_trait]
impl AggregationJob for PchartDaily {
    fn name(&self) -> &'static str {
        "pchart_daily"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Workstation
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let mut groups: BTreeMap<(NaiveDate, String, String, String, String), PchartCounts> =
            BTreeMap::new();
        let mut excluded = 0u64;
        let mut incomplete = 0u64;

        let scanned = ctx
            .warehouse
            .scan_workstation(window::daily(ctx), &mut |r: WorkstationRecord| {
                if rules.is_excluded_flow(r.service_flow.as_deref()) {
                    excluded += 1;
                    return;
                }
                let (Some(pn), Some(model), Some(flow)) = (r.pn, r.model, r.service_flow) else {
                    incomplete += 1;
                    return;
                };
                let status = r.history_station_passing_status.as_deref();
                let counts = groups
                    .entry((r.history_station_end_time.date(), pn, model, r.workstation_name, flow))
                    .or_default();
                counts.total += 1;
                if rules.status.is_pass(status) {
                    counts.pass += 1;
                }
                if rules.status.is_fail(status, rules.workstation_fail_rule) {
                    counts.fail += 1;
                }
            })
            .await?;
        debug!(excluded, "events in excluded service flows");
        if incomplete > 0 {
            warn!(rows = incomplete, "rows without pn, model or service flow left out of the p-chart");
        }

        let rows = groups
            .into_iter()
            .map(|((date, pn, model, workstation_name, service_flow), c)| PchartDailyRow {
                date,
                pn,
                model,
                workstation_name,
                service_flow,
                total_count: c.total,
                pass_count: c.pass,
                fail_count: c.fail,
            })
            .collect();
        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::PchartDaily(rows)).await?);
        Ok(stats)
    }
}

/// Every event, bucketed by the hour it ended in.
pub struct StationHourlyCounts;

#[async_trait]
impl AggregationJob for StationHourlyCounts {
    fn name(&self) -> &'static str {
        "station_hourly_counts"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Workstation
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let mut counts: BTreeMap<(NaiveDate, u32, String), i64> = BTreeMap::new();
        let scanned = ctx
            .warehouse
            .scan_workstation(window::daily(ctx), &mut |r: WorkstationRecord| {
                let end = r.history_station_end_time;
                *counts.entry((end.date(), end.hour(), r.workstation_name)).or_default() += 1;
            })
            .await?;

        let rows = counts
            .into_iter()
            .map(|((date, hour, workstation_name), part_count)| StationHourlyRow {
                date,
                hour: hour as i32,
                workstation_name,
                part_count,
            })
            .collect();
        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::StationHourly(rows)).await?);
        Ok(stats)
    }
}

/// Passing events at the test station for models with a sort code, weekend
/// output credited to Friday.
pub struct SortTestDaily;

#[async_trait]
impl AggregationJob for SortTestDaily {
    fn name(&self) -> &'static str {
        "sort_test_daily"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Workstation
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let mut counts: BTreeMap<(NaiveDate, String), i64> = BTreeMap::new();

        let scanned = ctx
            .warehouse
            .scan_workstation(window::weekend_folded(ctx), &mut |r: WorkstationRecord| {
                if r.workstation_name != rules.sort_test_station
                    || !rules.status.is_pass(r.history_station_passing_status.as_deref())
                {
                    return;
                }
                let Some(code) = r.model.as_deref().and_then(|m| rules.sort_code_for(m)) else {
                    return;
                };
                let test_date = shift_weekend_to_friday(r.history_station_end_time.date());
                *counts.entry((test_date, code.to_string())).or_default() += 1;
            })
            .await?;

        let rows = counts
            .into_iter()
            .map(|((test_date, sort_code), test_count)| SortTestDailyRow {
                test_date,
                sort_code,
                test_count,
            })
            .collect();
        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::SortTestDaily(rows)).await?);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, context, day, seed_workstation, ws};
    use crate::RunMode;
    use fox_storage::{tables, MemoryWarehouse};
    use std::sync::Arc;

    #[tokio::test]
    async fn weekend_packing_lands_on_friday() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(
            &warehouse,
            vec![
                ws("A", "Tesla SXM5", "PACKING", at(2025, 1, 4, 10), "Pass"),
                ws("B", "Tesla SXM5", "PACKING", at(2025, 1, 5, 10), "Pass"),
                ws("C", "Tesla SXM5", "PACKING", at(2025, 1, 6, 10), "Pass"),
                ws("D", "Tesla SXM5", "PACKING", at(2025, 1, 6, 11), "Fail"),
                ws("E", "Tesla SXM5", "FQC", at(2025, 1, 6, 12), "Pass"),
            ],
        )
        .await;
        let ctx = context(warehouse.clone(), RunMode::Full, day(2025, 1, 6));
        PackingDaily.run(&ctx).await.unwrap();

        let rows: Vec<PackingDailyRow> = warehouse.summary_rows(tables::PACKING_DAILY).await;
        let by_day: Vec<(NaiveDate, i64)> = rows.iter().map(|r| (r.pack_date, r.packed_count)).collect();
        assert_eq!(by_day, vec![(day(2025, 1, 3), 2), (day(2025, 1, 6), 1)]);
    }

    #[tokio::test]
    async fn recent_packing_upsert_overwrites_the_friday_bucket() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(
            &warehouse,
            vec![
                ws("A", "Tesla SXM5", "PACKING", at(2025, 1, 3, 10), "Pass"),
                ws("B", "Tesla SXM5", "PACKING", at(2025, 1, 4, 10), "Pass"),
            ],
        )
        .await;
        // Seven days ending 2025-01-10 open on Saturday the 4th; Friday the 3rd
        // still has to be counted in full.
        let ctx = context(warehouse.clone(), RunMode::Recent, day(2025, 1, 10));
        PackingDaily.run(&ctx).await.unwrap();
        let rows: Vec<PackingDailyRow> = warehouse.summary_rows(tables::PACKING_DAILY).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].packed_count, 2);

        seed_workstation(
            &warehouse,
            vec![ws("C", "Tesla SXM5", "PACKING", at(2025, 1, 5, 9), "Pass")],
        )
        .await;
        PackingDaily.run(&ctx).await.unwrap();
        let rows: Vec<PackingDailyRow> = warehouse.summary_rows(tables::PACKING_DAILY).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pack_date, day(2025, 1, 3));
        assert_eq!(rows[0].packed_count, 3);
    }

    #[tokio::test]
    async fn pchart_skips_noise_flows_and_counts_non_pass_as_fail() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut rework = ws("C", "Tesla SXM5", "FI", at(2025, 1, 6, 10), "Pass");
        rework.service_flow = Some("RO".to_string());
        let mut unrouted = ws("D", "Tesla SXM5", "FI", at(2025, 1, 6, 10), "Pass");
        unrouted.service_flow = None;
        seed_workstation(
            &warehouse,
            vec![
                ws("A", "Tesla SXM5", "FI", at(2025, 1, 6, 8), "Pass"),
                ws("B", "Tesla SXM5", "FI", at(2025, 1, 6, 9), "Retest"),
                rework,
                unrouted,
            ],
        )
        .await;
        let ctx = context(warehouse.clone(), RunMode::Full, day(2025, 1, 6));
        PchartDaily.run(&ctx).await.unwrap();

        let rows: Vec<PchartDailyRow> = warehouse.summary_rows(tables::PCHART_DAILY).await;
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].total_count, rows[0].pass_count, rows[0].fail_count), (2, 1, 1));
    }

    #[tokio::test]
    async fn pchart_leaves_out_rows_without_pn_or_model() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut no_pn = ws("B", "Tesla SXM5", "FI", at(2025, 1, 6, 9), "Fail");
        no_pn.pn = None;
        let mut no_model = ws("C", "Tesla SXM5", "FI", at(2025, 1, 6, 10), "Fail");
        no_model.model = None;
        seed_workstation(
            &warehouse,
            vec![ws("A", "Tesla SXM5", "FI", at(2025, 1, 6, 8), "Pass"), no_pn, no_model],
        )
        .await;
        let ctx = context(warehouse.clone(), RunMode::Full, day(2025, 1, 6));
        let stats = PchartDaily.run(&ctx).await.unwrap();
        assert_eq!(stats.scanned, 3);

        let rows: Vec<PchartDailyRow> = warehouse.summary_rows(tables::PCHART_DAILY).await;
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].total_count, rows[0].pass_count, rows[0].fail_count), (1, 1, 0));
    }

    #[tokio::test]
    async fn hourly_counts_include_every_event() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut rework = ws("C", "Tesla SXM5", "FI", at(2025, 1, 6, 8), "Fail");
        rework.service_flow = Some("NC Sort".to_string());
        seed_workstation(
            &warehouse,
            vec![
                ws("A", "Tesla SXM5", "FI", at(2025, 1, 6, 8), "Pass"),
                ws("B", "Tesla SXM4", "FI", at(2025, 1, 6, 8), "Pass"),
                rework,
                ws("D", "Tesla SXM4", "FI", at(2025, 1, 6, 23), "Pass"),
            ],
        )
        .await;
        let ctx = context(warehouse.clone(), RunMode::Full, day(2025, 1, 6));
        StationHourlyCounts.run(&ctx).await.unwrap();

        let rows: Vec<StationHourlyRow> = warehouse.summary_rows(tables::STATION_HOURLY).await;
        let counts: Vec<(i32, i64)> = rows.iter().map(|r| (r.hour, r.part_count)).collect();
        assert_eq!(counts, vec![(8, 3), (23, 1)]);
    }

    #[tokio::test]
    async fn sort_test_maps_models_to_codes() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(
            &warehouse,
            vec![
                ws("A", "Tesla SXM4", "TEST", at(2025, 1, 6, 8), "Pass"),
                ws("B", "Tesla SXM5", "TEST", at(2025, 1, 5, 8), "Pass"),
                ws("C", "Tesla SXM5", "TEST", at(2025, 1, 6, 8), "Fail"),
                ws("D", "SXM6", "TEST", at(2025, 1, 6, 8), "Pass"),
            ],
        )
        .await;
        let ctx = context(warehouse.clone(), RunMode::Full, day(2025, 1, 6));
        SortTestDaily.run(&ctx).await.unwrap();

        let rows: Vec<SortTestDailyRow> = warehouse.summary_rows(tables::SORT_TEST_DAILY).await;
        let got: Vec<(NaiveDate, &str, i64)> = rows
            .iter()
            .map(|r| (r.test_date, r.sort_code.as_str(), r.test_count))
            .collect();
        assert_eq!(got, vec![(day(2025, 1, 3), "520", 1), (day(2025, 1, 6), "506", 1)]);
    }
}
