//! Spreadsheet ingestion: read portal exports, map them onto raw records,
//! insert them without duplicates, and watch the drop directory for new files.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fox_storage::{tables, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod converter;
pub mod importer;
pub mod mapping;
pub mod monitor;
pub mod sheet;

pub use converter::Converter;
pub use importer::{BulkImportReport, ImportReport, Importer};
pub use mapping::{map_snfn_rows, map_testboard_rows, map_workstation_rows, parse_timestamp};
pub use monitor::{FileEvent, FileMonitor, PollResult};
pub use sheet::{read_sheet, Cell, Sheet, SheetRow};

pub const CRATE_NAME: &str = "fox-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading workbook {path}: {source}")]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("{0} has no worksheet")]
    NoWorksheet(PathBuf),
    #[error("row {row}: missing required value `{column}`")]
    MissingValue { row: usize, column: &'static str },
    #[error("row {row}: cannot read `{value}` in `{column}` as a timestamp")]
    BadTimestamp {
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("storing rows: {0}")]
    Store(#[from] StoreError),
    #[error("converter `{program}` failed: {detail}")]
    Convert { program: String, detail: String },
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The three report types the portal exports, each under a fixed file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Workstation,
    Testboard,
    Snfn,
}

impl ReportKind {
    pub const ALL: [ReportKind; 3] = [ReportKind::Workstation, ReportKind::Testboard, ReportKind::Snfn];

    /// Legacy-format file name as dropped by the portal.
    pub fn file_name(&self) -> &'static str {
        match self {
            ReportKind::Workstation => "workstationOutputReport.xls",
            ReportKind::Testboard => "Test board record report.xls",
            ReportKind::Snfn => "snfnReport.xls",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            ReportKind::Workstation => tables::WORKSTATION_LOG,
            ReportKind::Testboard => tables::TESTBOARD_LOG,
            ReportKind::Snfn => tables::SNFN_LOG,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Workstation => "workstation",
            ReportKind::Testboard => "testboard",
            ReportKind::Snfn => "snfn",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "workstation" => Ok(ReportKind::Workstation),
            "testboard" | "test_board" => Ok(ReportKind::Testboard),
            "snfn" => Ok(ReportKind::Snfn),
            other => Err(format!(
                "unknown report kind `{other}` (expected workstation, testboard or snfn)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub input_dir: PathBuf,
    pub poll_interval: Duration,
    pub converter_program: String,
    pub convert_timeout: Duration,
    pub import_timeout: Duration,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        fn secs(var: &str, default: u64) -> Duration {
            Duration::from_secs(
                std::env::var(var)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default),
            )
        }

        Self {
            input_dir: std::env::var("FOX_INPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./input")),
            poll_interval: secs("FOX_POLL_SECS", 10),
            converter_program: std::env::var("FOX_CONVERTER")
                .unwrap_or_else(|_| "libreoffice".to_string()),
            convert_timeout: secs("FOX_CONVERT_TIMEOUT_SECS", 60),
            import_timeout: secs("FOX_IMPORT_TIMEOUT_SECS", 300),
        }
    }

    pub fn converter(&self) -> Converter {
        Converter::new(&self.converter_program, self.convert_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_kinds_parse_from_cli_spelling() {
        assert_eq!("Workstation".parse::<ReportKind>(), Ok(ReportKind::Workstation));
        assert_eq!("test_board".parse::<ReportKind>(), Ok(ReportKind::Testboard));
        assert!("packing".parse::<ReportKind>().is_err());
    }

    #[test]
    fn file_names_are_fixed_by_the_portal() {
        assert_eq!(ReportKind::Testboard.file_name(), "Test board record report.xls");
        assert_eq!(ReportKind::Snfn.table(), "snfn_master_log");
        for kind in ReportKind::ALL {
            assert!(kind.file_name().ends_with(".xls"));
        }
    }
}
