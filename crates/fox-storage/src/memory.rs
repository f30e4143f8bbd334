//! In-process `Warehouse` with the same dedup and upsert semantics as the
//! Postgres backend. Backs the importer and job tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use fox_core::{
    DailyTpyRow, NaturalKey, SnfnRecord, TestboardRecord, WorkstationRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    tables, DailyTpyTotals, InsertOutcome, RawBatch, StoreError, SummaryBatch, TestboardSink,
    TimeWindow, Warehouse, WorkstationSink, WriteMode, WriteOutcome,
};

type SnfnKey = (
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    NaiveDateTime,
);

fn snfn_key(r: &SnfnRecord) -> SnfnKey {
    (
        r.sn.clone(),
        r.fixture_no.clone(),
        r.model.clone(),
        r.workstation_name.clone(),
        r.error_code.clone(),
        r.history_station_end_time,
    )
}

#[derive(Debug, Default)]
struct MemoryState {
    workstation: Vec<WorkstationRecord>,
    workstation_keys: HashSet<WorkstationRecord>,
    testboard: Vec<TestboardRecord>,
    testboard_keys: HashSet<TestboardRecord>,
    snfn: Vec<SnfnRecord>,
    snfn_keys: HashSet<SnfnKey>,
    summaries: HashMap<&'static str, BTreeMap<String, serde_json::Value>>,
    unavailable: HashSet<String>,
    rejected: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn check_available(&self, table: &str) -> Result<(), StoreError> {
        if self.unavailable.contains(table) {
            return Err(StoreError::Unavailable {
                table: table.to_string(),
                reason: "marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn write_rows<R: NaturalKey + Serialize>(
        &mut self,
        table: &'static str,
        rows: &[R],
        mode: WriteMode,
    ) -> Result<WriteOutcome, StoreError> {
        self.check_available(table)?;
        // Stage first so an encoding failure leaves the table untouched.
        let mut staged = Vec::with_capacity(rows.len());
        let mut outcome = WriteOutcome::default();
        for row in rows {
            let key = row.natural_key();
            if self.rejected.get(table).is_some_and(|keys| keys.contains(&key)) {
                warn!(table, key = %key, "skipping summary row");
                outcome.skipped += 1;
                continue;
            }
            let value = serde_json::to_value(row)
                .map_err(|source| StoreError::Encode { table, source })?;
            staged.push((key, value));
            outcome.written += 1;
        }

        let target = self.summaries.entry(table).or_default();
        if mode == WriteMode::Replace {
            target.clear();
        }
        target.extend(staged);
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation touching `table` fails with a transient error.
    pub async fn mark_unavailable(&self, table: &str) {
        self.state.lock().await.unavailable.insert(table.to_string());
    }

    pub async fn mark_available(&self, table: &str) {
        self.state.lock().await.unavailable.remove(table);
    }

    /// The row with this natural key is refused, as a constraint violation would.
    pub async fn reject_row(&self, table: &str, key: impl Into<String>) {
        self.state
            .lock()
            .await
            .rejected
            .entry(table.to_string())
            .or_default()
            .insert(key.into());
    }

    pub async fn raw_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        match table {
            tables::WORKSTATION_LOG => state.workstation.len(),
            tables::TESTBOARD_LOG => state.testboard.len(),
            tables::SNFN_LOG => state.snfn.len(),
            _ => 0,
        }
    }

    pub async fn snfn_records(&self) -> Vec<SnfnRecord> {
        self.state.lock().await.snfn.clone()
    }

    /// Rows of a summary table in natural-key order.
    pub async fn summary_rows<R: DeserializeOwned>(&self, table: &str) -> Vec<R> {
        let state = self.state.lock().await;
        state
            .summaries
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw JSON snapshot of a summary table, for byte-level comparisons.
    pub async fn summary_snapshot(&self, table: &str) -> BTreeMap<String, serde_json::Value> {
        self.state
            .lock()
            .await
            .summaries
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

fn dedup_into<T, K>(
    rows: Vec<T>,
    key_of: impl Fn(&T) -> K,
    keys: &mut HashSet<K>,
    store: &mut Vec<T>,
) -> InsertOutcome
where
    K: std::hash::Hash + Eq,
{
    let mut outcome = InsertOutcome::default();
    for row in rows {
        if keys.insert(key_of(&row)) {
            store.push(row);
            outcome.inserted += 1;
        } else {
            outcome.duplicates += 1;
        }
    }
    outcome
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn insert_raw(&self, batch: RawBatch) -> Result<InsertOutcome, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_available(batch.table())?;
        let outcome = match batch {
            RawBatch::Workstation(rows) => dedup_into(
                rows,
                Clone::clone,
                &mut state.workstation_keys,
                &mut state.workstation,
            ),
            RawBatch::Testboard(rows) => dedup_into(
                rows,
                Clone::clone,
                &mut state.testboard_keys,
                &mut state.testboard,
            ),
            RawBatch::Snfn(rows) => {
                dedup_into(rows, snfn_key, &mut state.snfn_keys, &mut state.snfn)
            }
        };
        Ok(outcome)
    }

    async fn scan_workstation(
        &self,
        window: TimeWindow,
        sink: &mut WorkstationSink<'_>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        state.check_available(tables::WORKSTATION_LOG)?;
        let mut delivered = 0u64;
        for record in state
            .workstation
            .iter()
            .filter(|r| window.contains(r.history_station_end_time))
        {
            sink(record.clone());
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn scan_testboard(
        &self,
        window: TimeWindow,
        sink: &mut TestboardSink<'_>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        state.check_available(tables::TESTBOARD_LOG)?;
        let mut delivered = 0u64;
        for record in state
            .testboard
            .iter()
            .filter(|r| window.contains(r.history_station_end_time))
        {
            sink(record.clone());
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn write_summaries(
        &self,
        batch: SummaryBatch,
        mode: WriteMode,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let table = batch.table();
        match &batch {
            SummaryBatch::StationPerformance(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::FixturePerformance(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::SnfnAggregate(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::PackingDaily(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::PchartDaily(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::StationHourly(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::SortTestDaily(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::DailyTpy(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::WeeklyTpy(rows) => state.write_rows(table, rows, mode),
            SummaryBatch::WeeklyTpyModel(rows) => state.write_rows(table, rows, mode),
        }
    }

    async fn daily_tpy_totals(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DailyTpyTotals, StoreError> {
        let state = self.state.lock().await;
        state.check_available(tables::DAILY_TPY)?;
        let mut totals = DailyTpyTotals::default();
        if let Some(rows) = state.summaries.get(tables::DAILY_TPY) {
            for value in rows.values() {
                let row: DailyTpyRow = serde_json::from_value(value.clone()).map_err(|source| {
                    StoreError::Encode {
                        table: tables::DAILY_TPY,
                        source,
                    }
                })?;
                if row.date_id >= from && row.date_id <= to {
                    totals.total_parts += row.total_parts;
                    totals.passed_parts += row.passed_parts;
                }
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fox_core::PackingDailyRow;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn event(sn: &str, end: NaiveDateTime) -> WorkstationRecord {
        WorkstationRecord {
            sn: sn.to_string(),
            pn: Some("692-2G520".to_string()),
            model: Some("Tesla SXM5".to_string()),
            workstation_name: "PACKING".to_string(),
            history_station_start_time: end,
            history_station_end_time: end,
            history_station_passing_status: Some("Pass".to_string()),
            operator: None,
            customer_pn: None,
            hours: None,
            service_flow: Some("Normal".to_string()),
            passing_station_method: None,
            first_station_start_time: None,
            data_source: "workstation".to_string(),
        }
    }

    fn packed(day: u32, count: i64) -> PackingDailyRow {
        PackingDailyRow {
            pack_date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            model: "Tesla SXM5".to_string(),
            part_number: "692-2G520".to_string(),
            packed_count: count,
        }
    }

    #[tokio::test]
    async fn raw_inserts_skip_known_keys() {
        let warehouse = MemoryWarehouse::new();
        let batch = RawBatch::Workstation(vec![event("A", ts(6, 9)), event("B", ts(6, 10))]);
        let first = warehouse.insert_raw(batch.clone()).await.unwrap();
        let second = warehouse.insert_raw(batch).await.unwrap();
        assert_eq!(first, InsertOutcome { inserted: 2, duplicates: 0 });
        assert_eq!(second, InsertOutcome { inserted: 0, duplicates: 2 });
        assert_eq!(warehouse.raw_count(tables::WORKSTATION_LOG).await, 2);
    }

    #[tokio::test]
    async fn scans_respect_the_window() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .insert_raw(RawBatch::Workstation(vec![
                event("A", ts(5, 23)),
                event("B", ts(6, 0)),
                event("C", ts(7, 0)),
            ]))
            .await
            .unwrap();
        let mut seen = Vec::new();
        let window = TimeWindow::days(
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
        );
        let delivered = warehouse
            .scan_workstation(window, &mut |r: WorkstationRecord| seen.push(r.sn))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(seen, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn upsert_overwrites_and_replace_truncates() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .write_summaries(
                SummaryBatch::PackingDaily(vec![packed(6, 3), packed(7, 1)]),
                WriteMode::Upsert,
            )
            .await
            .unwrap();
        warehouse
            .write_summaries(SummaryBatch::PackingDaily(vec![packed(6, 5)]), WriteMode::Upsert)
            .await
            .unwrap();
        let rows: Vec<PackingDailyRow> = warehouse.summary_rows(tables::PACKING_DAILY).await;
        assert_eq!(rows, vec![packed(6, 5), packed(7, 1)]);

        warehouse
            .write_summaries(SummaryBatch::PackingDaily(vec![packed(8, 2)]), WriteMode::Replace)
            .await
            .unwrap();
        let rows: Vec<PackingDailyRow> = warehouse.summary_rows(tables::PACKING_DAILY).await;
        assert_eq!(rows, vec![packed(8, 2)]);
    }

    #[tokio::test]
    async fn rejected_rows_are_skipped_and_counted() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .reject_row(tables::PACKING_DAILY, packed(7, 0).natural_key())
            .await;
        let outcome = warehouse
            .write_summaries(
                SummaryBatch::PackingDaily(vec![packed(6, 3), packed(7, 1)]),
                WriteMode::Upsert,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome { written: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn unavailable_tables_fail_transiently() {
        let warehouse = MemoryWarehouse::new();
        warehouse.mark_unavailable(tables::PACKING_DAILY).await;
        let err = warehouse
            .write_summaries(SummaryBatch::PackingDaily(vec![packed(6, 3)]), WriteMode::Upsert)
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Transient);
    }
}
