//! Core domain model for the Fox manufacturing-test ETL: raw log records,
//! derived summary rows, and the business rules shared by every job.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub mod calendar;
pub mod rules;
pub mod yields;

pub use calendar::{iso_week_id, shift_weekend_to_friday, week_bounds, week_start_of};
pub use rules::{AggregationRules, FailRule, ModelFamily, StatusVocabulary};
pub use yields::{
    derive_error_code, dynamic_tpy, first_pass_yield, hardcoded_tpy, round_to, throughput_yield,
    FirstPassYield, FpyBreakdown, FpyFigure, SerialProgress,
};

pub const CRATE_NAME: &str = "fox-core";

pub const WORKSTATION_SOURCE: &str = "workstation";
pub const TESTBOARD_SOURCE: &str = "testboard";
pub const SNFN_SOURCE: &str = "snfn";

/// Lowercase, map whitespace and hyphens to `_`, drop anything else that is not
/// alphanumeric. `"History Station-End Time"` becomes `history_station_end_time`.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() || c == '-' => Some('_'),
            c if c.is_alphanumeric() || c == '_' => Some(c),
            _ => None,
        })
        .collect()
}

/// One station event from the workstation output report.
///
/// Every field takes part in the natural key, so `Eq`/`Hash` on the whole
/// record is the dedup contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkstationRecord {
    pub sn: String,
    pub pn: Option<String>,
    pub model: Option<String>,
    pub workstation_name: String,
    pub history_station_start_time: NaiveDateTime,
    pub history_station_end_time: NaiveDateTime,
    pub history_station_passing_status: Option<String>,
    pub operator: Option<String>,
    pub customer_pn: Option<String>,
    pub hours: Option<String>,
    pub service_flow: Option<String>,
    pub passing_station_method: Option<String>,
    pub first_station_start_time: Option<NaiveDateTime>,
    pub data_source: String,
}

/// One fixture-based board test event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestboardRecord {
    pub sn: String,
    pub pn: Option<String>,
    pub model: Option<String>,
    pub work_station_process: Option<String>,
    pub baseboard_sn: Option<String>,
    pub baseboard_pn: Option<String>,
    pub workstation_name: String,
    pub history_station_start_time: NaiveDateTime,
    pub history_station_end_time: NaiveDateTime,
    pub history_station_passing_status: Option<String>,
    pub operator: Option<String>,
    pub failure_reasons: Option<String>,
    pub failure_note: Option<String>,
    pub failure_code: Option<String>,
    pub diag_version: Option<String>,
    pub fixture_no: Option<String>,
    pub data_source: String,
}

/// One row of the portal's serial-number failure report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnfnRecord {
    pub workstation_name: String,
    pub fixture_no: Option<String>,
    pub error_code: Option<String>,
    pub error_disc: Option<String>,
    pub sn: String,
    pub pn: Option<String>,
    pub model: Option<String>,
    pub history_station_start_time: NaiveDateTime,
    pub history_station_end_time: NaiveDateTime,
    pub data_source: String,
}

/// Composite natural key of a derived row, flattened for map storage.
pub trait NaturalKey {
    fn natural_key(&self) -> String;
}

fn join_key(parts: &[&str]) -> String {
    parts.join("\u{1f}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationPerformanceRow {
    pub end_date: NaiveDate,
    pub model: String,
    pub work_station_process: String,
    pub workstation_name: String,
    pub pass: i64,
    pub fail: i64,
    pub total: i64,
    pub failurerate: f64,
}

impl NaturalKey for StationPerformanceRow {
    fn natural_key(&self) -> String {
        join_key(&[
            &self.end_date.to_string(),
            &self.model,
            &self.work_station_process,
            &self.workstation_name,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixturePerformanceRow {
    pub day: NaiveDate,
    pub fixture_no: String,
    pub model: String,
    pub pn: String,
    pub workstation_name: String,
    pub pass: i64,
    pub fail: i64,
    pub total: i64,
}

impl NaturalKey for FixturePerformanceRow {
    fn natural_key(&self) -> String {
        join_key(&[
            &self.day.to_string(),
            &self.fixture_no,
            &self.model,
            &self.pn,
            &self.workstation_name,
        ])
    }
}

/// A distinct failure occurrence, not a count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnfnAggregateRow {
    pub fixture_no: String,
    pub workstation_name: String,
    pub sn: String,
    pub pn: Option<String>,
    pub model: String,
    pub error_code: String,
    pub error_disc: Option<String>,
    pub history_station_end_time: NaiveDateTime,
}

impl NaturalKey for SnfnAggregateRow {
    fn natural_key(&self) -> String {
        join_key(&[
            &self.sn,
            &self.fixture_no,
            &self.model,
            &self.workstation_name,
            &self.error_code,
            &self.history_station_end_time.to_string(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackingDailyRow {
    pub pack_date: NaiveDate,
    pub model: String,
    pub part_number: String,
    pub packed_count: i64,
}

impl NaturalKey for PackingDailyRow {
    fn natural_key(&self) -> String {
        join_key(&[&self.pack_date.to_string(), &self.model, &self.part_number])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PchartDailyRow {
    pub date: NaiveDate,
    pub pn: String,
    pub model: String,
    pub workstation_name: String,
    pub service_flow: String,
    pub total_count: i64,
    pub pass_count: i64,
    pub fail_count: i64,
}

impl NaturalKey for PchartDailyRow {
    fn natural_key(&self) -> String {
        join_key(&[
            &self.date.to_string(),
            &self.pn,
            &self.model,
            &self.workstation_name,
            &self.service_flow,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationHourlyRow {
    pub date: NaiveDate,
    pub hour: i32,
    pub workstation_name: String,
    pub part_count: i64,
}

impl NaturalKey for StationHourlyRow {
    fn natural_key(&self) -> String {
        join_key(&[
            &self.date.to_string(),
            &format!("{:02}", self.hour),
            &self.workstation_name,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortTestDailyRow {
    pub test_date: NaiveDate,
    pub sort_code: String,
    pub test_count: i64,
}

impl NaturalKey for SortTestDailyRow {
    fn natural_key(&self) -> String {
        join_key(&[&self.test_date.to_string(), &self.sort_code])
    }
}

/// Per-station daily yield with the context of the week the day belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTpyRow {
    pub date_id: NaiveDate,
    pub model: String,
    pub workstation_name: String,
    pub total_parts: i64,
    pub passed_parts: i64,
    pub failed_parts: i64,
    pub throughput_yield: f64,
    pub week_id: String,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub total_starters: i64,
}

impl NaturalKey for DailyTpyRow {
    fn natural_key(&self) -> String {
        join_key(&[&self.date_id.to_string(), &self.model, &self.workstation_name])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationYield {
    pub total: i64,
    pub passed: i64,
    pub throughput_yield: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyTpyRow {
    pub week_id: String,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub days_in_week: i32,
    pub first_pass_yield: FirstPassYield,
    pub overall_total_parts: i64,
    pub overall_completed_parts: i64,
    pub overall_yield: f64,
    pub station_metrics: BTreeMap<String, StationYield>,
    pub average_yield: f64,
    pub total_stations: i32,
    pub best_station_name: Option<String>,
    pub best_station_yield: Option<f64>,
    pub worst_station_name: Option<String>,
    pub worst_station_yield: Option<f64>,
}

impl NaturalKey for WeeklyTpyRow {
    fn natural_key(&self) -> String {
        self.week_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyTpyModelRow {
    pub week_id: String,
    pub model: String,
    pub hardcoded_stations: Vec<String>,
    pub hardcoded_tpy: Option<f64>,
    pub dynamic_stations: Vec<String>,
    pub dynamic_tpy: Option<f64>,
    pub dynamic_station_count: i32,
}

impl NaturalKey for WeeklyTpyModelRow {
    fn natural_key(&self) -> String {
        join_key(&[&self.week_id, &self.model])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_normalize_to_schema_spelling() {
        assert_eq!(
            normalize_column_name(" History Station-End Time "),
            "history_station_end_time"
        );
        assert_eq!(normalize_column_name("Fixture No."), "fixture_no");
        assert_eq!(normalize_column_name("SN"), "sn");
        assert_eq!(
            normalize_column_name("Number of times baseboard is used"),
            "number_of_times_baseboard_is_used"
        );
    }

    #[test]
    fn natural_keys_ignore_measure_columns() {
        let day = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        let a = PackingDailyRow {
            pack_date: day,
            model: "Tesla SXM5".into(),
            part_number: "692-2G520".into(),
            packed_count: 4,
        };
        let b = PackingDailyRow {
            packed_count: 9,
            ..a.clone()
        };
        assert_eq!(a.natural_key(), b.natural_key());
    }
}
