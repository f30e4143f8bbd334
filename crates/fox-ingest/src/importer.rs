//! Deduplicating import of one report file, or of a directory of them.

use std::collections::HashSet;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fox_storage::{RawBatch, Warehouse};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use walkdir::WalkDir;

use crate::mapping::{map_snfn_rows, map_testboard_rows, map_workstation_rows};
use crate::sheet::read_sheet;
use crate::{IngestError, ReportKind};

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub kind: ReportKind,
    pub file: PathBuf,
    pub rows_read: usize,
    pub in_file_duplicates: usize,
    pub inserted: u64,
    pub already_present: u64,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkImportReport {
    pub imported: Vec<ImportReport>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BulkImportReport {
    pub fn inserted(&self) -> u64 {
        self.imported.iter().map(|r| r.inserted).sum()
    }
}

/// Drops repeated rows inside one file, keeping the first occurrence.
fn dedup_in_file<T: Hash + Eq + Clone>(rows: Vec<T>) -> (Vec<T>, usize) {
    let before = rows.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<T> = rows.into_iter().filter(|r| seen.insert(r.clone())).collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

fn read_batch(kind: ReportKind, path: &Path) -> Result<(RawBatch, usize, usize), IngestError> {
    let sheet = read_sheet(path)?;
    let rows_read = sheet.len();
    let (batch, dropped) = match kind {
        ReportKind::Workstation => {
            let (rows, dropped) = dedup_in_file(map_workstation_rows(&sheet)?);
            (RawBatch::Workstation(rows), dropped)
        }
        ReportKind::Testboard => {
            let (rows, dropped) = dedup_in_file(map_testboard_rows(&sheet)?);
            (RawBatch::Testboard(rows), dropped)
        }
        ReportKind::Snfn => {
            let (rows, dropped) = dedup_in_file(map_snfn_rows(&sheet)?);
            (RawBatch::Snfn(rows), dropped)
        }
    };
    Ok((batch, rows_read, dropped))
}

fn is_workbook(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("xlsx") || e.eq_ignore_ascii_case("xls"))
}

/// Every workbook beneath `root`, depth first in file-name order. Unreadable
/// entries are logged and skipped.
fn collect_workbooks(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_workbook(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

#[derive(Clone)]
pub struct Importer {
    warehouse: Arc<dyn Warehouse>,
}

impl Importer {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Reads, maps and inserts one file. Nothing is written unless every row
    /// of the file maps cleanly. The file itself is left alone.
    pub async fn import_file(&self, kind: ReportKind, path: &Path) -> Result<ImportReport, IngestError> {
        let span = info_span!("import", kind = %kind, file = %path.display());
        async {
            let started = Instant::now();
            let owned = path.to_path_buf();
            let (batch, rows_read, in_file_duplicates) =
                tokio::task::spawn_blocking(move || read_batch(kind, &owned)).await??;
            let outcome = self.warehouse.insert_raw(batch).await?;
            let report = ImportReport {
                kind,
                file: path.to_path_buf(),
                rows_read,
                in_file_duplicates,
                inserted: outcome.inserted,
                already_present: outcome.duplicates,
                duration_ms: started.elapsed().as_millis(),
            };
            info!(
                table = kind.table(),
                rows_read,
                in_file_duplicates,
                inserted = report.inserted,
                already_present = report.already_present,
                "import complete"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Imports a single file, or every workbook beneath a directory in path
    /// order. A failed file is recorded and the walk continues.
    pub async fn import_path(&self, kind: ReportKind, path: &Path) -> Result<BulkImportReport, IngestError> {
        let files = if path.is_dir() {
            let root = path.to_path_buf();
            tokio::task::spawn_blocking(move || collect_workbooks(&root)).await?
        } else {
            vec![path.to_path_buf()]
        };

        let mut report = BulkImportReport::default();
        for file in files {
            match self.import_file(kind, &file).await {
                Ok(done) => report.imported.push(done),
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "import failed");
                    report.failed.push((file, err.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fox_storage::{tables, MemoryWarehouse};
    use rust_xlsxwriter::Workbook;

    pub(crate) const WORKSTATION_HEADERS: [&str; 8] = [
        "SN",
        "PN",
        "Model",
        "Workstation Name",
        "History station start time",
        "History station end time",
        "History station passing status",
        "Service Flow",
    ];

    pub(crate) fn write_workbook(path: &Path, headers: &[&str], rows: &[Vec<&str>]) {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, header) in headers.iter().enumerate() {
            sheet.write_string(0, col as u16, *header).unwrap();
        }
        for (r, row) in rows.iter().enumerate() {
            for (col, value) in row.iter().enumerate() {
                if !value.is_empty() {
                    sheet.write_string(r as u32 + 1, col as u16, *value).unwrap();
                }
            }
        }
        workbook.save(path).unwrap();
    }

    pub(crate) fn workstation_rows() -> Vec<Vec<&'static str>> {
        let a = vec![
            "SN-1", "692-2G520", "Tesla SXM5", "FI", "2025-01-06 08:00:00",
            "2025-01-06 09:00:00", "Pass", "Normal",
        ];
        let b = vec![
            "SN-2", "692-2G520", "Tesla SXM5", "PACKING", "",
            "2025-01-06 10:00:00", "Pass", "Normal",
        ];
        vec![a.clone(), b, a]
    }

    #[tokio::test]
    async fn importing_the_same_file_twice_adds_nothing_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workstationOutputReport.xlsx");
        write_workbook(&path, &WORKSTATION_HEADERS, &workstation_rows());

        let warehouse = Arc::new(MemoryWarehouse::new());
        let importer = Importer::new(warehouse.clone());

        let first = importer.import_file(ReportKind::Workstation, &path).await.unwrap();
        assert_eq!(first.rows_read, 3);
        assert_eq!(first.in_file_duplicates, 1);
        assert_eq!(first.inserted, 2);

        let second = importer.import_file(ReportKind::Workstation, &path).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.already_present, 2);
        assert_eq!(warehouse.raw_count(tables::WORKSTATION_LOG).await, 2);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn a_malformed_row_rolls_back_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workstationOutputReport.xlsx");
        let mut rows = workstation_rows();
        rows.push(vec![
            "SN-3", "692-2G520", "Tesla SXM5", "FI", "", "not a time", "Pass", "Normal",
        ]);
        write_workbook(&path, &WORKSTATION_HEADERS, &rows);

        let warehouse = Arc::new(MemoryWarehouse::new());
        let importer = Importer::new(warehouse.clone());
        let err = importer
            .import_file(ReportKind::Workstation, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::BadTimestamp { row: 5, .. }));
        assert_eq!(warehouse.raw_count(tables::WORKSTATION_LOG).await, 0);
    }

    #[tokio::test]
    async fn directory_import_continues_past_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2025").join("01");
        let deeper = nested.join("line-3");
        std::fs::create_dir_all(&deeper).unwrap();
        write_workbook(&nested.join("a.xlsx"), &WORKSTATION_HEADERS, &workstation_rows());
        std::fs::write(nested.join("b.xlsx"), b"corrupt").unwrap();
        std::fs::write(nested.join("notes.txt"), b"ignored").unwrap();
        let late = vec![vec![
            "SN-9", "692-2G520", "Tesla SXM5", "FI", "2025-01-07 08:00:00",
            "2025-01-07 09:00:00", "Fail", "Normal",
        ]];
        write_workbook(&deeper.join("c.xlsx"), &WORKSTATION_HEADERS, &late);

        let warehouse = Arc::new(MemoryWarehouse::new());
        let importer = Importer::new(warehouse.clone());
        let report = importer
            .import_path(ReportKind::Workstation, dir.path())
            .await
            .unwrap();
        assert_eq!(report.imported.len(), 2);
        assert!(report.imported[0].file.ends_with("a.xlsx"));
        assert!(report.imported[1].file.ends_with("line-3/c.xlsx"));
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("b.xlsx"));
        assert_eq!(report.inserted(), 3);
    }

    #[test]
    fn workbook_walk_descends_every_level_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("z.XLSX"), b"").unwrap();
        std::fs::write(dir.path().join("a").join("m.xls"), b"").unwrap();
        std::fs::write(dir.path().join("top.xlsx"), b"").unwrap();
        std::fs::write(deep.join("skip.csv"), b"").unwrap();

        let found: Vec<PathBuf> = collect_workbooks(dir.path())
            .into_iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("a/b/c/z.XLSX"),
                PathBuf::from("a/m.xls"),
                PathBuf::from("top.xlsx"),
            ]
        );
    }

    #[test]
    fn in_file_dedup_keeps_first_occurrence() {
        let (kept, dropped) = dedup_in_file(vec![3, 1, 3, 2, 1]);
        assert_eq!(kept, vec![3, 1, 2]);
        assert_eq!(dropped, 2);
    }
}
