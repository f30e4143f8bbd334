//! Postgres-backed `Warehouse`.

use async_trait::async_trait;
use chrono::NaiveDate;
use fox_core::{
    DailyTpyRow, FixturePerformanceRow, NaturalKey, PackingDailyRow, PchartDailyRow,
    SnfnAggregateRow, SnfnRecord, SortTestDailyRow, StationHourlyRow, StationPerformanceRow,
    TestboardRecord, WeeklyTpyModelRow, WeeklyTpyRow, WorkstationRecord,
};
use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Connection, Postgres, QueryBuilder, Row};
use tracing::{debug, warn};

use crate::{
    tables, DailyTpyTotals, ErrorClass, InsertOutcome, RawBatch, StoreError, SummaryBatch,
    TestboardSink, TimeWindow, Warehouse, WorkstationSink, WriteMode, WriteOutcome,
};

/// 14 binds per row keeps a chunk well under the 65535 parameter limit.
const INSERT_CHUNK: usize = 1_000;

const WORKSTATION_COLUMNS: &str = "sn, pn, model, workstation_name, \
    history_station_start_time, history_station_end_time, history_station_passing_status, \
    operator, customer_pn, hours, service_flow, passing_station_method, \
    first_station_start_time, data_source";

const TESTBOARD_COLUMNS: &str = "sn, pn, model, work_station_process, baseboard_sn, \
    baseboard_pn, workstation_name, history_station_start_time, history_station_end_time, \
    history_station_passing_status, operator, failure_reasons, failure_note, failure_code, \
    diag_version, fixture_no, data_source";

const TESTBOARD_INSERT: &str = "INSERT INTO testboard_master_log (sn, pn, model, \
    work_station_process, baseboard_sn, baseboard_pn, workstation_name, \
    history_station_start_time, history_station_end_time, history_station_passing_status, \
    operator, failure_reasons, failure_note, failure_code, diag_version, fixture_no, data_source) \
    SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17 \
    WHERE NOT EXISTS ( \
        SELECT 1 FROM testboard_master_log \
        WHERE sn = $1 AND pn IS NOT DISTINCT FROM $2 AND model IS NOT DISTINCT FROM $3 \
        AND work_station_process IS NOT DISTINCT FROM $4 \
        AND baseboard_sn IS NOT DISTINCT FROM $5 AND baseboard_pn IS NOT DISTINCT FROM $6 \
        AND workstation_name = $7 AND history_station_start_time = $8 \
        AND history_station_end_time = $9 \
        AND history_station_passing_status IS NOT DISTINCT FROM $10 \
        AND operator IS NOT DISTINCT FROM $11 AND failure_reasons IS NOT DISTINCT FROM $12 \
        AND failure_note IS NOT DISTINCT FROM $13 AND failure_code IS NOT DISTINCT FROM $14 \
        AND diag_version IS NOT DISTINCT FROM $15 AND fixture_no IS NOT DISTINCT FROM $16 \
        AND data_source = $17)";

const SNFN_INSERT: &str = "INSERT INTO snfn_master_log (workstation_name, fixture_no, \
    error_code, error_disc, sn, pn, model, history_station_start_time, \
    history_station_end_time, data_source) \
    SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10 \
    WHERE NOT EXISTS ( \
        SELECT 1 FROM snfn_master_log \
        WHERE sn = $5 AND fixture_no IS NOT DISTINCT FROM $2 \
        AND model IS NOT DISTINCT FROM $7 AND workstation_name = $1 \
        AND error_code IS NOT DISTINCT FROM $3 AND history_station_end_time = $9)";

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// A summary row that knows its table and its `ON CONFLICT ... DO UPDATE`.
trait PgUpsert: NaturalKey + Send + Sync {
    const TABLE: &'static str;
    const UPSERT: &'static str;

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q>;
}

impl PgUpsert for StationPerformanceRow {
    const TABLE: &'static str = tables::STATION_PERFORMANCE;
    const UPSERT: &'static str = "INSERT INTO testboard_station_performance_daily \
        (end_date, model, work_station_process, workstation_name, pass, fail, total, failurerate) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
        ON CONFLICT (end_date, model, work_station_process, workstation_name) DO UPDATE SET \
        pass = EXCLUDED.pass, fail = EXCLUDED.fail, total = EXCLUDED.total, \
        failurerate = EXCLUDED.failurerate";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.end_date)
            .bind(&self.model)
            .bind(&self.work_station_process)
            .bind(&self.workstation_name)
            .bind(self.pass)
            .bind(self.fail)
            .bind(self.total)
            .bind(self.failurerate)
    }
}

impl PgUpsert for FixturePerformanceRow {
    const TABLE: &'static str = tables::FIXTURE_PERFORMANCE;
    const UPSERT: &'static str = "INSERT INTO fixture_performance_daily \
        (day, fixture_no, model, pn, workstation_name, pass, fail, total) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
        ON CONFLICT (day, fixture_no, model, pn, workstation_name) DO UPDATE SET \
        pass = EXCLUDED.pass, fail = EXCLUDED.fail, total = EXCLUDED.total";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.day)
            .bind(&self.fixture_no)
            .bind(&self.model)
            .bind(&self.pn)
            .bind(&self.workstation_name)
            .bind(self.pass)
            .bind(self.fail)
            .bind(self.total)
    }
}

impl PgUpsert for SnfnAggregateRow {
    const TABLE: &'static str = tables::SNFN_AGGREGATE;
    const UPSERT: &'static str = "INSERT INTO snfn_aggregate_daily \
        (fixture_no, workstation_name, sn, pn, model, error_code, error_disc, history_station_end_time) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
        ON CONFLICT (sn, fixture_no, model, workstation_name, error_code, history_station_end_time) \
        DO UPDATE SET error_disc = EXCLUDED.error_disc, pn = EXCLUDED.pn";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(&self.fixture_no)
            .bind(&self.workstation_name)
            .bind(&self.sn)
            .bind(&self.pn)
            .bind(&self.model)
            .bind(&self.error_code)
            .bind(&self.error_disc)
            .bind(self.history_station_end_time)
    }
}

impl PgUpsert for PackingDailyRow {
    const TABLE: &'static str = tables::PACKING_DAILY;
    const UPSERT: &'static str = "INSERT INTO packing_daily_summary \
        (pack_date, model, part_number, packed_count) VALUES ($1, $2, $3, $4) \
        ON CONFLICT (pack_date, model, part_number) DO UPDATE SET \
        packed_count = EXCLUDED.packed_count";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.pack_date)
            .bind(&self.model)
            .bind(&self.part_number)
            .bind(self.packed_count)
    }
}

impl PgUpsert for PchartDailyRow {
    const TABLE: &'static str = tables::PCHART_DAILY;
    const UPSERT: &'static str = "INSERT INTO workstation_pchart_daily \
        (date, pn, model, workstation_name, service_flow, total_count, pass_count, fail_count) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
        ON CONFLICT (date, pn, model, workstation_name, service_flow) DO UPDATE SET \
        total_count = EXCLUDED.total_count, pass_count = EXCLUDED.pass_count, \
        fail_count = EXCLUDED.fail_count";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.date)
            .bind(&self.pn)
            .bind(&self.model)
            .bind(&self.workstation_name)
            .bind(&self.service_flow)
            .bind(self.total_count)
            .bind(self.pass_count)
            .bind(self.fail_count)
    }
}

impl PgUpsert for StationHourlyRow {
    const TABLE: &'static str = tables::STATION_HOURLY;
    const UPSERT: &'static str = "INSERT INTO station_hourly_summary \
        (date, hour, workstation_name, part_count) VALUES ($1, $2, $3, $4) \
        ON CONFLICT (date, hour, workstation_name) DO UPDATE SET \
        part_count = EXCLUDED.part_count";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.date)
            .bind(self.hour)
            .bind(&self.workstation_name)
            .bind(self.part_count)
    }
}

impl PgUpsert for SortTestDailyRow {
    const TABLE: &'static str = tables::SORT_TEST_DAILY;
    const UPSERT: &'static str = "INSERT INTO sort_test_daily (test_date, sort_code, test_count) \
        VALUES ($1, $2, $3) \
        ON CONFLICT (test_date, sort_code) DO UPDATE SET test_count = EXCLUDED.test_count";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.test_date)
            .bind(&self.sort_code)
            .bind(self.test_count)
    }
}

impl PgUpsert for DailyTpyRow {
    const TABLE: &'static str = tables::DAILY_TPY;
    const UPSERT: &'static str = "INSERT INTO daily_tpy_metrics \
        (date_id, model, workstation_name, total_parts, passed_parts, failed_parts, \
         throughput_yield, week_id, week_start, week_end, total_starters) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
        ON CONFLICT (date_id, model, workstation_name) DO UPDATE SET \
        total_parts = EXCLUDED.total_parts, passed_parts = EXCLUDED.passed_parts, \
        failed_parts = EXCLUDED.failed_parts, throughput_yield = EXCLUDED.throughput_yield, \
        week_id = EXCLUDED.week_id, week_start = EXCLUDED.week_start, \
        week_end = EXCLUDED.week_end, total_starters = EXCLUDED.total_starters, \
        created_at = NOW()";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.date_id)
            .bind(&self.model)
            .bind(&self.workstation_name)
            .bind(self.total_parts)
            .bind(self.passed_parts)
            .bind(self.failed_parts)
            .bind(self.throughput_yield)
            .bind(&self.week_id)
            .bind(self.week_start)
            .bind(self.week_end)
            .bind(self.total_starters)
    }
}

impl PgUpsert for WeeklyTpyRow {
    const TABLE: &'static str = tables::WEEKLY_TPY;
    const UPSERT: &'static str = "INSERT INTO weekly_tpy_metrics (\
        week_id, week_start, week_end, days_in_week, \
        weekly_first_pass_yield_traditional_parts_started, \
        weekly_first_pass_yield_traditional_first_pass_success, \
        weekly_first_pass_yield_traditional_first_pass_yield, \
        weekly_first_pass_yield_completed_only_active_parts, \
        weekly_first_pass_yield_completed_only_first_pass_success, \
        weekly_first_pass_yield_completed_only_first_pass_yield, \
        weekly_first_pass_yield_breakdown_parts_completed, \
        weekly_first_pass_yield_breakdown_parts_failed, \
        weekly_first_pass_yield_breakdown_parts_stuck_in_limbo, \
        weekly_first_pass_yield_breakdown_total_parts, \
        weekly_overall_yield_total_parts, weekly_overall_yield_completed_parts, \
        weekly_overall_yield_overall_yield, weekly_throughput_yield_station_metrics, \
        weekly_throughput_yield_average_yield, total_stations, \
        best_station_name, best_station_yield, worst_station_name, worst_station_yield) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
                $18, $19, $20, $21, $22, $23, $24) \
        ON CONFLICT (week_id) DO UPDATE SET \
        week_start = EXCLUDED.week_start, week_end = EXCLUDED.week_end, \
        days_in_week = EXCLUDED.days_in_week, \
        weekly_first_pass_yield_traditional_parts_started = EXCLUDED.weekly_first_pass_yield_traditional_parts_started, \
        weekly_first_pass_yield_traditional_first_pass_success = EXCLUDED.weekly_first_pass_yield_traditional_first_pass_success, \
        weekly_first_pass_yield_traditional_first_pass_yield = EXCLUDED.weekly_first_pass_yield_traditional_first_pass_yield, \
        weekly_first_pass_yield_completed_only_active_parts = EXCLUDED.weekly_first_pass_yield_completed_only_active_parts, \
        weekly_first_pass_yield_completed_only_first_pass_success = EXCLUDED.weekly_first_pass_yield_completed_only_first_pass_success, \
        weekly_first_pass_yield_completed_only_first_pass_yield = EXCLUDED.weekly_first_pass_yield_completed_only_first_pass_yield, \
        weekly_first_pass_yield_breakdown_parts_completed = EXCLUDED.weekly_first_pass_yield_breakdown_parts_completed, \
        weekly_first_pass_yield_breakdown_parts_failed = EXCLUDED.weekly_first_pass_yield_breakdown_parts_failed, \
        weekly_first_pass_yield_breakdown_parts_stuck_in_limbo = EXCLUDED.weekly_first_pass_yield_breakdown_parts_stuck_in_limbo, \
        weekly_first_pass_yield_breakdown_total_parts = EXCLUDED.weekly_first_pass_yield_breakdown_total_parts, \
        weekly_overall_yield_total_parts = EXCLUDED.weekly_overall_yield_total_parts, \
        weekly_overall_yield_completed_parts = EXCLUDED.weekly_overall_yield_completed_parts, \
        weekly_overall_yield_overall_yield = EXCLUDED.weekly_overall_yield_overall_yield, \
        weekly_throughput_yield_station_metrics = EXCLUDED.weekly_throughput_yield_station_metrics, \
        weekly_throughput_yield_average_yield = EXCLUDED.weekly_throughput_yield_average_yield, \
        total_stations = EXCLUDED.total_stations, \
        best_station_name = EXCLUDED.best_station_name, \
        best_station_yield = EXCLUDED.best_station_yield, \
        worst_station_name = EXCLUDED.worst_station_name, \
        worst_station_yield = EXCLUDED.worst_station_yield";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        let fpy = &self.first_pass_yield;
        query
            .bind(&self.week_id)
            .bind(self.week_start)
            .bind(self.week_end)
            .bind(self.days_in_week)
            .bind(fpy.traditional.parts)
            .bind(fpy.traditional.first_pass_success)
            .bind(fpy.traditional.yield_pct)
            .bind(fpy.completed_only.parts)
            .bind(fpy.completed_only.first_pass_success)
            .bind(fpy.completed_only.yield_pct)
            .bind(fpy.breakdown.parts_completed)
            .bind(fpy.breakdown.parts_failed)
            .bind(fpy.breakdown.parts_stuck_in_limbo)
            .bind(fpy.breakdown.total_parts)
            .bind(self.overall_total_parts)
            .bind(self.overall_completed_parts)
            .bind(self.overall_yield)
            .bind(Json(&self.station_metrics))
            .bind(self.average_yield)
            .bind(self.total_stations)
            .bind(&self.best_station_name)
            .bind(self.best_station_yield)
            .bind(&self.worst_station_name)
            .bind(self.worst_station_yield)
    }
}

impl PgUpsert for WeeklyTpyModelRow {
    const TABLE: &'static str = tables::WEEKLY_TPY_MODEL;
    const UPSERT: &'static str = "INSERT INTO weekly_tpy_model_metrics \
        (week_id, model, hardcoded_stations, hardcoded_tpy, dynamic_stations, dynamic_tpy, \
         dynamic_station_count) \
        VALUES ($1, $2, $3, $4, $5, $6, $7) \
        ON CONFLICT (week_id, model) DO UPDATE SET \
        hardcoded_stations = EXCLUDED.hardcoded_stations, hardcoded_tpy = EXCLUDED.hardcoded_tpy, \
        dynamic_stations = EXCLUDED.dynamic_stations, dynamic_tpy = EXCLUDED.dynamic_tpy, \
        dynamic_station_count = EXCLUDED.dynamic_station_count";

    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(&self.week_id)
            .bind(&self.model)
            .bind(Json(&self.hardcoded_stations))
            .bind(self.hardcoded_tpy)
            .bind(Json(&self.dynamic_stations))
            .bind(self.dynamic_tpy)
            .bind(self.dynamic_station_count)
    }
}

fn scan_sql(columns: &str, table: &str, window: &TimeWindow) -> String {
    match window {
        TimeWindow::AllTime => format!("SELECT {columns} FROM {table} ORDER BY id"),
        TimeWindow::Range { .. } => format!(
            "SELECT {columns} FROM {table} \
             WHERE history_station_end_time >= $1 AND history_station_end_time < $2 \
             ORDER BY id"
        ),
    }
}

fn workstation_from_row(row: &PgRow) -> Result<WorkstationRecord, sqlx::Error> {
    Ok(WorkstationRecord {
        sn: row.try_get("sn")?,
        pn: row.try_get("pn")?,
        model: row.try_get("model")?,
        workstation_name: row.try_get("workstation_name")?,
        history_station_start_time: row.try_get("history_station_start_time")?,
        history_station_end_time: row.try_get("history_station_end_time")?,
        history_station_passing_status: row.try_get("history_station_passing_status")?,
        operator: row.try_get("operator")?,
        customer_pn: row.try_get("customer_pn")?,
        hours: row.try_get("hours")?,
        service_flow: row.try_get("service_flow")?,
        passing_station_method: row.try_get("passing_station_method")?,
        first_station_start_time: row.try_get("first_station_start_time")?,
        data_source: row.try_get("data_source")?,
    })
}

fn testboard_from_row(row: &PgRow) -> Result<TestboardRecord, sqlx::Error> {
    Ok(TestboardRecord {
        sn: row.try_get("sn")?,
        pn: row.try_get("pn")?,
        model: row.try_get("model")?,
        work_station_process: row.try_get("work_station_process")?,
        baseboard_sn: row.try_get("baseboard_sn")?,
        baseboard_pn: row.try_get("baseboard_pn")?,
        workstation_name: row.try_get("workstation_name")?,
        history_station_start_time: row.try_get("history_station_start_time")?,
        history_station_end_time: row.try_get("history_station_end_time")?,
        history_station_passing_status: row.try_get("history_station_passing_status")?,
        operator: row.try_get("operator")?,
        failure_reasons: row.try_get("failure_reasons")?,
        failure_note: row.try_get("failure_note")?,
        failure_code: row.try_get("failure_code")?,
        diag_version: row.try_get("diag_version")?,
        fixture_no: row.try_get("fixture_no")?,
        data_source: row.try_get("data_source")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_workstation(
        &self,
        records: &[WorkstationRecord],
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({WORKSTATION_COLUMNS}) ",
                tables::WORKSTATION_LOG
            ));
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(&r.sn)
                    .push_bind(&r.pn)
                    .push_bind(&r.model)
                    .push_bind(&r.workstation_name)
                    .push_bind(r.history_station_start_time)
                    .push_bind(r.history_station_end_time)
                    .push_bind(&r.history_station_passing_status)
                    .push_bind(&r.operator)
                    .push_bind(&r.customer_pn)
                    .push_bind(&r.hours)
                    .push_bind(&r.service_flow)
                    .push_bind(&r.passing_station_method)
                    .push_bind(r.first_station_start_time)
                    .push_bind(&r.data_source);
            });
            builder.push(" ON CONFLICT ON CONSTRAINT workstation_unique_constraint DO NOTHING");
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(InsertOutcome {
            inserted,
            duplicates: records.len() as u64 - inserted,
        })
    }

    async fn insert_testboard(
        &self,
        records: &[TestboardRecord],
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for r in records {
            inserted += sqlx::query(TESTBOARD_INSERT)
                .bind(&r.sn)
                .bind(&r.pn)
                .bind(&r.model)
                .bind(&r.work_station_process)
                .bind(&r.baseboard_sn)
                .bind(&r.baseboard_pn)
                .bind(&r.workstation_name)
                .bind(r.history_station_start_time)
                .bind(r.history_station_end_time)
                .bind(&r.history_station_passing_status)
                .bind(&r.operator)
                .bind(&r.failure_reasons)
                .bind(&r.failure_note)
                .bind(&r.failure_code)
                .bind(&r.diag_version)
                .bind(&r.fixture_no)
                .bind(&r.data_source)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(InsertOutcome {
            inserted,
            duplicates: records.len() as u64 - inserted,
        })
    }

    async fn insert_snfn(&self, records: &[SnfnRecord]) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for r in records {
            inserted += sqlx::query(SNFN_INSERT)
                .bind(&r.workstation_name)
                .bind(&r.fixture_no)
                .bind(&r.error_code)
                .bind(&r.error_disc)
                .bind(&r.sn)
                .bind(&r.pn)
                .bind(&r.model)
                .bind(r.history_station_start_time)
                .bind(r.history_station_end_time)
                .bind(&r.data_source)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(InsertOutcome {
            inserted,
            duplicates: records.len() as u64 - inserted,
        })
    }

    async fn write_rows<R: PgUpsert>(
        &self,
        rows: &[R],
        mode: WriteMode,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        if mode == WriteMode::Replace {
            let truncate = format!("TRUNCATE TABLE {}", R::TABLE);
            sqlx::query(&truncate).execute(&mut *tx).await?;
        }

        let mut outcome = WriteOutcome::default();
        for row in rows {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            let result = row.bind(sqlx::query(R::UPSERT)).execute(&mut *savepoint).await;
            match result {
                Ok(_) => {
                    savepoint.commit().await?;
                    outcome.written += 1;
                }
                Err(err) => {
                    let err = StoreError::from(err);
                    if err.class() == ErrorClass::Transient {
                        return Err(err);
                    }
                    savepoint.rollback().await?;
                    warn!(table = R::TABLE, key = %row.natural_key(), error = %err, "skipping summary row");
                    outcome.skipped += 1;
                }
            }
        }
        tx.commit().await?;
        debug!(table = R::TABLE, written = outcome.written, skipped = outcome.skipped, "summary batch committed");
        Ok(outcome)
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn insert_raw(&self, batch: RawBatch) -> Result<InsertOutcome, StoreError> {
        match &batch {
            RawBatch::Workstation(rows) => self.insert_workstation(rows).await,
            RawBatch::Testboard(rows) => self.insert_testboard(rows).await,
            RawBatch::Snfn(rows) => self.insert_snfn(rows).await,
        }
    }

    async fn scan_workstation(
        &self,
        window: TimeWindow,
        sink: &mut WorkstationSink<'_>,
    ) -> Result<u64, StoreError> {
        let sql = scan_sql(WORKSTATION_COLUMNS, tables::WORKSTATION_LOG, &window);
        let mut query = sqlx::query(&sql);
        if let TimeWindow::Range { start, end } = window {
            query = query.bind(start).bind(end);
        }
        let mut rows = query.fetch(&self.pool);
        let mut delivered = 0u64;
        while let Some(row) = rows.try_next().await? {
            sink(workstation_from_row(&row)?);
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn scan_testboard(
        &self,
        window: TimeWindow,
        sink: &mut TestboardSink<'_>,
    ) -> Result<u64, StoreError> {
        let sql = scan_sql(TESTBOARD_COLUMNS, tables::TESTBOARD_LOG, &window);
        let mut query = sqlx::query(&sql);
        if let TimeWindow::Range { start, end } = window {
            query = query.bind(start).bind(end);
        }
        let mut rows = query.fetch(&self.pool);
        let mut delivered = 0u64;
        while let Some(row) = rows.try_next().await? {
            sink(testboard_from_row(&row)?);
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn write_summaries(
        &self,
        batch: SummaryBatch,
        mode: WriteMode,
    ) -> Result<WriteOutcome, StoreError> {
        match &batch {
            SummaryBatch::StationPerformance(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::FixturePerformance(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::SnfnAggregate(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::PackingDaily(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::PchartDaily(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::StationHourly(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::SortTestDaily(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::DailyTpy(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::WeeklyTpy(rows) => self.write_rows(rows, mode).await,
            SummaryBatch::WeeklyTpyModel(rows) => self.write_rows(rows, mode).await,
        }
    }

    async fn daily_tpy_totals(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DailyTpyTotals, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_parts), 0)::BIGINT AS total_parts, \
                    COALESCE(SUM(passed_parts), 0)::BIGINT AS passed_parts \
             FROM daily_tpy_metrics WHERE date_id >= $1 AND date_id <= $2",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(DailyTpyTotals {
            total_parts: row.try_get("total_parts")?,
            passed_parts: row.try_get("passed_parts")?,
        })
    }
}
