//! Throughput and first-pass yield, daily per station and rolled up weekly.
//!
//! Both jobs share one view of the workstation log: events outside the noise
//! service flows and away from the sorting station, for rows with a model. A
//! serial starts in the ISO week holding its first such event over the whole
//! history, so a recent run still scans everything to find first activity but
//! only groups events inside whole weeks of its window.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{Days, NaiveDate, NaiveDateTime};
use fox_core::{
    dynamic_tpy, first_pass_yield, hardcoded_tpy, iso_week_id, round_to, throughput_yield,
    week_bounds, week_start_of, AggregationRules, DailyTpyRow, SerialProgress, StationYield,
    WeeklyTpyModelRow, WeeklyTpyRow, WorkstationRecord,
};
use fox_storage::{SummaryBatch, TimeWindow};
use tracing::{info, warn};

use crate::{window, AggregationJob, JobCategory, JobContext, JobError, JobStats};

#[derive(Debug, Clone)]
struct TpyEvent {
    sn: String,
    model: String,
    workstation: String,
    end: NaiveDateTime,
    passed: bool,
    failed: bool,
}

impl TpyEvent {
    fn serial(&self) -> (&str, &str) {
        (&self.sn, &self.model)
    }
}

#[derive(Debug, Default)]
struct TpyHistory {
    first_seen: HashMap<(String, String), NaiveDateTime>,
    events: Vec<TpyEvent>,
    without_model: u64,
}

impl TpyHistory {
    async fn load(ctx: &JobContext) -> Result<(Self, u64), JobError> {
        let rules = ctx.rules.as_ref();
        let window = window::whole_weeks(ctx);
        let mut history = TpyHistory::default();
        let scanned = ctx
            .warehouse
            .scan_workstation(TimeWindow::AllTime, &mut |r: WorkstationRecord| {
                history.observe(rules, window, r);
            })
            .await?;
        if history.without_model > 0 {
            warn!(rows = history.without_model, "workstation rows without a model left out of throughput");
        }
        Ok((history, scanned))
    }

    fn observe(&mut self, rules: &AggregationRules, window: TimeWindow, r: WorkstationRecord) {
        if rules.is_excluded_flow(r.service_flow.as_deref()) || rules.is_sorting(&r.workstation_name) {
            return;
        }
        let Some(model) = r.model else {
            self.without_model += 1;
            return;
        };
        let end = r.history_station_end_time;
        self.first_seen
            .entry((r.sn.clone(), model.clone()))
            .and_modify(|first| {
                if end < *first {
                    *first = end;
                }
            })
            .or_insert(end);
        if window.contains(end) {
            let status = r.history_station_passing_status.as_deref();
            self.events.push(TpyEvent {
                passed: rules.status.is_pass(status),
                failed: rules.status.is_fail(status, rules.workstation_fail_rule),
                sn: r.sn,
                model,
                workstation: r.workstation_name,
                end,
            });
        }
    }

    /// Serials keyed by the Monday of the week they started in.
    fn starters_by_week(&self) -> HashMap<NaiveDate, BTreeSet<(&str, &str)>> {
        let mut weeks: HashMap<NaiveDate, BTreeSet<(&str, &str)>> = HashMap::new();
        for ((sn, model), first) in &self.first_seen {
            weeks
                .entry(week_start_of(first.date()))
                .or_default()
                .insert((sn.as_str(), model.as_str()));
        }
        weeks
    }

    fn events_by_week(&self) -> BTreeMap<NaiveDate, Vec<&TpyEvent>> {
        let mut weeks: BTreeMap<NaiveDate, Vec<&TpyEvent>> = BTreeMap::new();
        for event in &self.events {
            weeks.entry(week_start_of(event.end.date())).or_default().push(event);
        }
        weeks
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StationTally {
    total: i64,
    passed: i64,
    failed: i64,
}

impl StationTally {
    fn add(&mut self, event: &TpyEvent) {
        self.total += 1;
        if event.passed {
            self.passed += 1;
        }
        if event.failed {
            self.failed += 1;
        }
    }

    fn station_yield(&self) -> StationYield {
        StationYield {
            total: self.total,
            passed: self.passed,
            throughput_yield: throughput_yield(self.passed, self.total).unwrap_or_default(),
        }
    }
}

fn station_yields(tallies: BTreeMap<&str, StationTally>) -> BTreeMap<String, StationYield> {
    tallies
        .into_iter()
        .map(|(station, tally)| (station.to_string(), tally.station_yield()))
        .collect()
}

fn sunday_after(monday: NaiveDate) -> NaiveDate {
    monday.checked_add_days(Days::new(6)).unwrap_or(monday)
}

/// Per-station daily yield for the tracked models, each row carrying the
/// week it belongs to and how many serials started that week.
pub struct TpyDaily;

#[async_trait]
impl AggregationJob for TpyDaily {
    fn name(&self) -> &'static str {
        "tpy_daily"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Throughput
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let (history, scanned) = TpyHistory::load(ctx).await?;
        let starters = history.starters_by_week();

        let mut groups: BTreeMap<(NaiveDate, &str, &str), StationTally> = BTreeMap::new();
        let mut completions: BTreeMap<NaiveDate, BTreeMap<(&str, &str), SerialProgress>> =
            BTreeMap::new();
        for event in &history.events {
            let date = event.end.date();
            if rules.daily_tpy_models.iter().any(|m| *m == event.model) {
                groups
                    .entry((date, event.model.as_str(), event.workstation.as_str()))
                    .or_default()
                    .add(event);
            }
            let started_this_week = starters
                .get(&week_start_of(date))
                .is_some_and(|week| week.contains(&event.serial()));
            if started_this_week {
                let progress = completions.entry(date).or_default().entry(event.serial()).or_default();
                progress.reached_terminal |= rules.is_terminal(&event.workstation);
                if event.failed {
                    progress.failures += 1;
                }
            }
        }

        for (date, serials) in &completions {
            let completed = serials.values().filter(|p| p.reached_terminal).count();
            let first_pass = serials.values().filter(|p| p.first_pass()).count();
            info!(%date, completed, first_pass, "completions among the week's starters");
        }

        let rows: Vec<DailyTpyRow> = groups
            .into_iter()
            .map(|((date_id, model, station), tally)| {
                let (week_start, week_end) = week_bounds(date_id);
                DailyTpyRow {
                    date_id,
                    model: model.to_string(),
                    workstation_name: station.to_string(),
                    total_parts: tally.total,
                    passed_parts: tally.passed,
                    failed_parts: tally.failed,
                    throughput_yield: throughput_yield(tally.passed, tally.total).unwrap_or_default(),
                    week_id: iso_week_id(date_id),
                    week_start,
                    week_end,
                    total_starters: starters.get(&week_start).map_or(0, |s| s.len() as i64),
                }
            })
            .collect();

        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::DailyTpy(rows)).await?);
        Ok(stats)
    }
}

/// Highest and lowest station yields; ties go to the first name in order.
fn best_and_worst(stations: &BTreeMap<String, StationYield>) -> (Option<(String, f64)>, Option<(String, f64)>) {
    let mut best: Option<(&String, f64)> = None;
    let mut worst: Option<(&String, f64)> = None;
    for (name, station) in stations {
        let y = station.throughput_yield;
        if best.map_or(true, |(_, b)| y > b) {
            best = Some((name, y));
        }
        if worst.map_or(true, |(_, w)| y < w) {
            worst = Some((name, y));
        }
    }
    (
        best.map(|(n, y)| (n.clone(), y)),
        worst.map(|(n, y)| (n.clone(), y)),
    )
}

/// Weekly roll-up: both first-pass yields over the week's starters, station
/// yields for the tracked models, overall yield from the daily table, and
/// per-family compounded TPY. Reads `daily_tpy_metrics`, so it runs after
/// `tpy_daily`.
pub struct TpyWeekly;

#[async_trait]
impl AggregationJob for TpyWeekly {
    fn name(&self) -> &'static str {
        "tpy_weekly"
    }

    fn category(&self) -> JobCategory {
        JobCategory::Throughput
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobStats, JobError> {
        let rules = ctx.rules.as_ref();
        let (history, scanned) = TpyHistory::load(ctx).await?;
        let starters = history.starters_by_week();
        let no_starters = BTreeSet::new();

        let mut weekly_rows = Vec::new();
        let mut model_rows = Vec::new();
        for (week_start, events) in history.events_by_week() {
            let week_end = sunday_after(week_start);
            let week_id = iso_week_id(week_start);

            let mut progress: BTreeMap<(&str, &str), SerialProgress> = starters
                .get(&week_start)
                .unwrap_or(&no_starters)
                .iter()
                .map(|serial| (*serial, SerialProgress::default()))
                .collect();
            let mut overall: BTreeMap<&str, StationTally> = BTreeMap::new();
            let mut per_model: BTreeMap<&str, BTreeMap<&str, StationTally>> = BTreeMap::new();
            for event in &events {
                if let Some(p) = progress.get_mut(&event.serial()) {
                    p.reached_terminal |= rules.is_terminal(&event.workstation);
                    if event.failed {
                        p.failures += 1;
                    }
                }
                if rules.daily_tpy_models.iter().any(|m| *m == event.model) {
                    overall.entry(event.workstation.as_str()).or_default().add(event);
                }
                per_model
                    .entry(event.model.as_str())
                    .or_default()
                    .entry(event.workstation.as_str())
                    .or_default()
                    .add(event);
            }

            let fpy = first_pass_yield(progress.values());
            let station_metrics = station_yields(overall);
            let average_yield = if station_metrics.is_empty() {
                0.0
            } else {
                let sum: f64 = station_metrics.values().map(|s| s.throughput_yield).sum();
                round_to(sum / station_metrics.len() as f64, 2)
            };
            let (best, worst) = best_and_worst(&station_metrics);
            let totals = ctx.warehouse.daily_tpy_totals(week_start, week_end).await?;

            info!(
                week = %week_id,
                starters = fpy.breakdown.total_parts,
                traditional_fpy = fpy.traditional.yield_pct,
                completed_only_fpy = fpy.completed_only.yield_pct,
                "weekly first-pass yield"
            );

            for family in &rules.model_families {
                let Some(tallies) = per_model.remove(family.model.as_str()) else {
                    continue;
                };
                let stations = station_yields(tallies);
                let (dynamic, count) = dynamic_tpy(&stations);
                model_rows.push(WeeklyTpyModelRow {
                    week_id: week_id.clone(),
                    model: family.model.clone(),
                    hardcoded_stations: family.stations.clone(),
                    hardcoded_tpy: hardcoded_tpy(&family.stations, &stations),
                    dynamic_stations: stations.keys().cloned().collect(),
                    dynamic_tpy: dynamic,
                    dynamic_station_count: count as i32,
                });
            }

            weekly_rows.push(WeeklyTpyRow {
                week_id,
                week_start,
                week_end,
                days_in_week: ((week_end - week_start).num_days() + 1) as i32,
                first_pass_yield: fpy,
                overall_total_parts: totals.total_parts,
                overall_completed_parts: totals.passed_parts,
                overall_yield: throughput_yield(totals.passed_parts, totals.total_parts)
                    .unwrap_or_default(),
                total_stations: station_metrics.len() as i32,
                average_yield,
                best_station_name: best.as_ref().map(|(n, _)| n.clone()),
                best_station_yield: best.map(|(_, y)| y),
                worst_station_name: worst.as_ref().map(|(n, _)| n.clone()),
                worst_station_yield: worst.map(|(_, y)| y),
                station_metrics,
            });
        }

        let mut stats = JobStats {
            scanned,
            ..JobStats::default()
        };
        stats.add_write(ctx.write(SummaryBatch::WeeklyTpy(weekly_rows)).await?);
        stats.add_write(ctx.write(SummaryBatch::WeeklyTpyModel(model_rows)).await?);
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

    const SXM5: &str = "Tesla SXM5";

    /// Ten serials starting on Tuesday 2025-01-07: six clean passes, two
    /// packed after a failure, one failed and one still in progress.
    fn fpy_week() -> Vec<WorkstationRecord> {
        let mut rows = Vec::new();
        for i in 1..=6 {
            let sn = format!("S{i}");
            rows.push(ws(&sn, SXM5, "FI", at(2025, 1, 7, 8), "Pass"));
            rows.push(ws(&sn, SXM5, "PACKING", at(2025, 1, 7, 12), "Pass"));
        }
        for sn in ["S7", "S8"] {
            rows.push(ws(sn, SXM5, "FI", at(2025, 1, 7, 8), "Fail"));
            rows.push(ws(sn, SXM5, "FI", at(2025, 1, 7, 9), "Pass"));
            rows.push(ws(sn, SXM5, "PACKING", at(2025, 1, 7, 12), "Pass"));
        }
        rows.push(ws("S9", SXM5, "FI", at(2025, 1, 7, 8), "Fail"));
        rows.push(ws("S10", SXM5, "FI", at(2025, 1, 7, 8), "Pass"));
        rows
    }

    async fn run_both(warehouse: &Arc<MemoryWarehouse>, mode: RunMode, today: NaiveDate) {
        let ctx = context(warehouse.clone(), mode, today);
        TpyDaily.run(&ctx).await.unwrap();
        TpyWeekly.run(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn traditional_and_completed_only_fpy() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(&warehouse, fpy_week()).await;
        run_both(&warehouse, RunMode::Full, day(2025, 1, 8)).await;

        let weeks: Vec<WeeklyTpyRow> = warehouse.summary_rows(tables::WEEKLY_TPY).await;
        assert_eq!(weeks.len(), 1);
        let week = &weeks[0];
        assert_eq!(week.week_id, "2025-W02");
        assert_eq!(week.week_start, day(2025, 1, 6));
        assert_eq!(week.week_end, day(2025, 1, 12));
        assert_eq!(week.days_in_week, 7);

        let fpy = &week.first_pass_yield;
        assert_eq!(fpy.traditional.parts, 10);
        assert_eq!(fpy.traditional.first_pass_success, 6);
        assert_eq!(fpy.traditional.yield_pct, 60.0);
        assert_eq!(fpy.completed_only.parts, 9);
        assert_eq!(fpy.completed_only.yield_pct, 66.67);
        assert_eq!(fpy.breakdown.parts_completed, 8);
        assert_eq!(fpy.breakdown.parts_failed, 1);
        assert_eq!(fpy.breakdown.parts_stuck_in_limbo, 1);
    }

    #[tokio::test]
    async fn a_week_always_spans_seven_days() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(
            &warehouse,
            vec![
                ws("D1", SXM5, "FI", at(2025, 1, 7, 8), "Pass"),
                ws("D2", SXM5, "FI", at(2025, 1, 8, 8), "Pass"),
            ],
        )
        .await;
        run_both(&warehouse, RunMode::Full, day(2025, 1, 8)).await;

        let weeks: Vec<WeeklyTpyRow> = warehouse.summary_rows(tables::WEEKLY_TPY).await;
        assert_eq!(weeks.len(), 1);
        assert_eq!(weeks[0].days_in_week, 7);
    }

    #[tokio::test]
    async fn rows_without_a_model_are_left_out() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut anonymous = ws("N1", SXM5, "FI", at(2025, 1, 7, 9), "Fail");
        anonymous.model = None;
        seed_workstation(
            &warehouse,
            vec![ws("M1", SXM5, "FI", at(2025, 1, 7, 8), "Pass"), anonymous],
        )
        .await;
        run_both(&warehouse, RunMode::Full, day(2025, 1, 8)).await;

        let daily: Vec<DailyTpyRow> = warehouse.summary_rows(tables::DAILY_TPY).await;
        assert_eq!(daily.len(), 1);
        assert_eq!((daily[0].total_parts, daily[0].total_starters), (1, 1));
        let weeks: Vec<WeeklyTpyRow> = warehouse.summary_rows(tables::WEEKLY_TPY).await;
        assert_eq!(weeks[0].first_pass_yield.traditional.parts, 1);
    }

    #[tokio::test]
    async fn daily_rows_carry_rounded_yield_and_week_context() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut rows = Vec::new();
        for i in 0..37 {
            let status = if i < 33 { "Pass" } else { "Fail" };
            rows.push(ws(&format!("Y{i}"), SXM5, "FQC", at(2025, 1, 7, 10), status));
        }
        let mut sorting = ws("Y0", SXM5, "SORTING", at(2025, 1, 7, 11), "Fail");
        sorting.service_flow = Some("Normal".to_string());
        rows.push(sorting);
        seed_workstation(&warehouse, rows).await;

        let ctx = context(warehouse.clone(), RunMode::Full, day(2025, 1, 8));
        TpyDaily.run(&ctx).await.unwrap();
        let daily: Vec<DailyTpyRow> = warehouse.summary_rows(tables::DAILY_TPY).await;
        assert_eq!(daily.len(), 1);
        let row = &daily[0];
        assert_eq!(row.workstation_name, "FQC");
        assert_eq!((row.total_parts, row.passed_parts, row.failed_parts), (37, 33, 4));
        assert_eq!(row.throughput_yield, 89.19);
        assert_eq!(row.week_id, "2025-W02");
        assert_eq!(row.total_starters, 37);
    }

    #[tokio::test]
    async fn serials_started_in_an_earlier_week_are_not_starters() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(
            &warehouse,
            vec![
                ws("OLD", SXM5, "FI", at(2024, 12, 31, 8), "Pass"),
                ws("OLD", SXM5, "PACKING", at(2025, 1, 7, 8), "Pass"),
                ws("NEW", SXM5, "FI", at(2025, 1, 7, 9), "Pass"),
            ],
        )
        .await;
        run_both(&warehouse, RunMode::Full, day(2025, 1, 8)).await;

        let weeks: Vec<WeeklyTpyRow> = warehouse.summary_rows(tables::WEEKLY_TPY).await;
        let ids: Vec<&str> = weeks.iter().map(|w| w.week_id.as_str()).collect();
        assert_eq!(ids, vec!["2025-W01", "2025-W02"]);
        let second = &weeks[1];
        assert_eq!(second.first_pass_yield.traditional.parts, 1);
        assert_eq!(second.first_pass_yield.breakdown.parts_stuck_in_limbo, 1);
    }

    #[tokio::test]
    async fn hardcoded_tpy_needs_every_station() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut rows = Vec::new();
        for station in ["BBD", "ASSY2", "FI"] {
            rows.push(ws("P1", SXM5, station, at(2025, 1, 7, 8), "Pass"));
            rows.push(ws("P2", SXM5, station, at(2025, 1, 7, 9), "Fail"));
        }
        seed_workstation(&warehouse, rows).await;
        run_both(&warehouse, RunMode::Full, day(2025, 1, 8)).await;

        let models: Vec<WeeklyTpyModelRow> = warehouse.summary_rows(tables::WEEKLY_TPY_MODEL).await;
        assert_eq!(models.len(), 1);
        let sxm5 = &models[0];
        assert_eq!(sxm5.model, SXM5);
        assert_eq!(sxm5.hardcoded_tpy, None);
        assert_eq!(sxm5.dynamic_station_count, 3);
        assert_eq!(sxm5.dynamic_tpy, Some(12.5));

        let week: Vec<WeeklyTpyRow> = warehouse.summary_rows(tables::WEEKLY_TPY).await;
        assert_eq!(week[0].overall_total_parts, 6);
        assert_eq!(week[0].overall_completed_parts, 3);
        assert_eq!(week[0].overall_yield, 50.0);
        assert_eq!(week[0].total_stations, 3);
        assert_eq!(week[0].best_station_name.as_deref(), Some("ASSY2"));
    }

    #[tokio::test]
    async fn weekly_rebuild_is_idempotent() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        seed_workstation(&warehouse, fpy_week()).await;
        run_both(&warehouse, RunMode::Full, day(2025, 1, 8)).await;
        let daily = warehouse.summary_snapshot(tables::DAILY_TPY).await;
        let weekly = warehouse.summary_snapshot(tables::WEEKLY_TPY).await;
        let models = warehouse.summary_snapshot(tables::WEEKLY_TPY_MODEL).await;

        run_both(&warehouse, RunMode::Full, day(2025, 1, 8)).await;
        assert_eq!(warehouse.summary_snapshot(tables::DAILY_TPY).await, daily);
        assert_eq!(warehouse.summary_snapshot(tables::WEEKLY_TPY).await, weekly);
        assert_eq!(warehouse.summary_snapshot(tables::WEEKLY_TPY_MODEL).await, models);

        run_both(&warehouse, RunMode::Recent, day(2025, 1, 8)).await;
        assert_eq!(warehouse.summary_snapshot(tables::WEEKLY_TPY).await, weekly);
    }

    #[test]
    fn ties_go_to_the_first_station_name() {
        let yields: BTreeMap<String, StationYield> = [("FI", 90.0), ("BBD", 90.0), ("FQC", 95.0)]
            .into_iter()
            .map(|(n, y)| {
                (
                    n.to_string(),
                    StationYield {
                        total: 10,
                        passed: 9,
                        throughput_yield: y,
                    },
                )
            })
            .collect();
        let (best, worst) = best_and_worst(&yields);
        assert_eq!(best, Some(("FQC".to_string(), 95.0)));
        assert_eq!(worst, Some(("BBD".to_string(), 90.0)));
    }
}
