//! Column mapping from normalized sheets onto raw records.
//!
//! Any unreadable timestamp or missing key column fails the whole sheet; the
//! only tolerated gap is a workstation start time, which falls back to the end
//! time.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use fox_core::{
    SnfnRecord, TestboardRecord, WorkstationRecord, SNFN_SOURCE, TESTBOARD_SOURCE,
    WORKSTATION_SOURCE,
};
use tracing::debug;

use crate::sheet::{Cell, Sheet, SheetRow};
use crate::IngestError;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

fn excel_serial(serial: f64) -> Option<NaiveDateTime> {
    if !(1.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_time(NaiveTime::MIN);
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(Duration::milliseconds(millis))
}

/// Permissive timestamp parsing: native spreadsheet dates, Excel serial
/// numbers, and the textual layouts the portal has been seen to emit. A blank
/// cell is `Ok(None)`; anything else unreadable is an error carrying the raw text.
pub fn parse_timestamp(cell: &Cell) -> Result<Option<NaiveDateTime>, String> {
    match cell {
        Cell::Empty => Ok(None),
        Cell::DateTime(ts) => Ok(Some(*ts)),
        Cell::Number(serial) => excel_serial(*serial)
            .map(Some)
            .ok_or_else(|| serial.to_string()),
        Cell::Bool(b) => Err(b.to_string()),
        Cell::Text(raw) => {
            let text = raw.trim();
            if text.is_empty() {
                return Ok(None);
            }
            for format in DATETIME_FORMATS {
                if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
                    return Ok(Some(ts));
                }
            }
            for format in DATE_FORMATS {
                if let Ok(day) = NaiveDate::parse_from_str(text, format) {
                    return Ok(Some(day.and_time(NaiveTime::MIN)));
                }
            }
            DateTime::parse_from_rfc3339(text)
                .map(|ts| Some(ts.naive_local()))
                .map_err(|_| text.to_string())
        }
    }
}

fn timestamp(row: &SheetRow<'_>, column: &'static str) -> Result<Option<NaiveDateTime>, IngestError> {
    parse_timestamp(row.cell(column)).map_err(|value| IngestError::BadTimestamp {
        row: row.number,
        column,
        value,
    })
}

fn required_timestamp(row: &SheetRow<'_>, column: &'static str) -> Result<NaiveDateTime, IngestError> {
    timestamp(row, column)?.ok_or(IngestError::MissingValue {
        row: row.number,
        column,
    })
}

fn required_text(row: &SheetRow<'_>, column: &'static str) -> Result<String, IngestError> {
    row.text(column).ok_or(IngestError::MissingValue {
        row: row.number,
        column,
    })
}

pub fn map_workstation_rows(sheet: &Sheet) -> Result<Vec<WorkstationRecord>, IngestError> {
    let mut backfilled = 0usize;
    let mut records = Vec::with_capacity(sheet.len());
    for row in sheet.rows() {
        let end = required_timestamp(&row, "history_station_end_time")?;
        let start = match timestamp(&row, "history_station_start_time")? {
            Some(start) => start,
            None => {
                backfilled += 1;
                end
            }
        };
        records.push(WorkstationRecord {
            sn: required_text(&row, "sn")?,
            pn: row.text("pn"),
            model: row.text("model"),
            workstation_name: required_text(&row, "workstation_name")?,
            history_station_start_time: start,
            history_station_end_time: end,
            history_station_passing_status: row.text("history_station_passing_status"),
            operator: row.text("operator"),
            customer_pn: row.text("customer_pn"),
            hours: row.text("hours"),
            service_flow: row.text("service_flow"),
            passing_station_method: row.text("passing_station_method"),
            first_station_start_time: timestamp(&row, "first_station_start_time")?,
            data_source: WORKSTATION_SOURCE.to_string(),
        });
    }
    if backfilled > 0 {
        debug!(backfilled, "workstation start times taken from end times");
    }
    Ok(records)
}

pub fn map_testboard_rows(sheet: &Sheet) -> Result<Vec<TestboardRecord>, IngestError> {
    sheet
        .rows()
        .map(|row| {
            Ok(TestboardRecord {
                sn: required_text(&row, "sn")?,
                pn: row.text("pn"),
                model: row.text("model"),
                work_station_process: row.text("work_station_process"),
                baseboard_sn: row.text("baseboard_sn"),
                baseboard_pn: row.text("baseboard_pn"),
                workstation_name: required_text(&row, "workstation_name")?,
                history_station_start_time: required_timestamp(&row, "history_station_start_time")?,
                history_station_end_time: required_timestamp(&row, "history_station_end_time")?,
                history_station_passing_status: row.text("history_station_passing_status"),
                operator: row.text("operator"),
                failure_reasons: row.text("failure_reasons"),
                failure_note: row.text("failure_note"),
                failure_code: row.text("failure_code"),
                diag_version: row.text("diag_version"),
                fixture_no: row.text("fixture_no"),
                data_source: TESTBOARD_SOURCE.to_string(),
            })
        })
        .collect()
}

pub fn map_snfn_rows(sheet: &Sheet) -> Result<Vec<SnfnRecord>, IngestError> {
    sheet
        .rows()
        .map(|row| {
            Ok(SnfnRecord {
                workstation_name: required_text(&row, "workstation_name")?,
                fixture_no: row.text("fixture_no"),
                error_code: row.text("error_code"),
                error_disc: row.text("error_disc"),
                sn: required_text(&row, "sn")?,
                pn: row.text("pn"),
                model: row.text("model"),
                history_station_start_time: required_timestamp(&row, "history_station_start_time")?,
                history_station_end_time: required_timestamp(&row, "history_station_end_time")?,
                data_source: SNFN_SOURCE.to_string(),
            })
        })
        .collect()
}
