//! First-worksheet reader with normalized headers.

use std::collections::HashMap;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};
use chrono::NaiveDateTime;
use fox_core::normalize_column_name;

use crate::IngestError;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    DateTime(NaiveDateTime),
    Bool(bool),
}

static EMPTY: Cell = Cell::Empty;

impl Cell {
    /// Text form of the cell. Blank strings read as `None`; integral numbers
    /// lose their trailing `.0` so part numbers survive a numeric column.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Cell::Number(n) => Some(n.to_string()),
            Cell::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::Bool(b) => Some(b.to_string()),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_text().is_none()
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty | Data::Error(_) => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::Bool(b) => Cell::Bool(*b),
            Data::DateTime(dt) => match dt.as_datetime() {
                Some(ts) => Cell::DateTime(ts),
                None => Cell::Number(dt.as_f64()),
            },
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sheet {
    headers: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Cell>>,
}

impl Sheet {
    /// Headers are normalized; the first occurrence of a repeated header wins.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let headers: Vec<String> = headers.iter().map(|h| normalize_column_name(h)).collect();
        let mut index = HashMap::new();
        for (i, name) in headers.iter().enumerate() {
            index.entry(name.clone()).or_insert(i);
        }
        Self {
            headers,
            index,
            rows,
        }
    }

    fn from_range(range: &Range<Data>) -> Self {
        let mut rows = range.rows();
        let headers = rows
            .next()
            .map(|header| {
                header
                    .iter()
                    .map(|c| Cell::from(c).as_text().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();
        let body = rows
            .map(|r| r.iter().map(Cell::from).collect::<Vec<_>>())
            .filter(|cells| cells.iter().any(|c| !c.is_blank()))
            .collect();
        Self::new(headers, body)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = SheetRow<'_>> {
        self.rows.iter().enumerate().map(move |(i, cells)| SheetRow {
            sheet: self,
            cells,
            // 1-based, header on line 1.
            number: i + 2,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SheetRow<'a> {
    sheet: &'a Sheet,
    cells: &'a [Cell],
    pub number: usize,
}

impl<'a> SheetRow<'a> {
    pub fn cell(&self, column: &str) -> &'a Cell {
        self.sheet
            .index
            .get(column)
            .and_then(|&i| self.cells.get(i))
            .unwrap_or(&EMPTY)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        self.cell(column).as_text()
    }
}

/// Reads the first worksheet of an `.xlsx` or `.xls` workbook. Blocking.
pub fn read_sheet(path: &Path) -> Result<Sheet, IngestError> {
    let mut workbook = open_workbook_auto(path).map_err(|source| IngestError::Workbook {
        path: path.to_path_buf(),
        source,
    })?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| IngestError::NoWorksheet(path.to_path_buf()))?
        .map_err(|source| IngestError::Workbook {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Sheet::from_range(&range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_reads_as_none() {
        assert_eq!(Cell::Text("  ".into()).as_text(), None);
        assert_eq!(Cell::Empty.as_text(), None);
        assert_eq!(Cell::Text(" FI ".into()).as_text(), Some("FI".into()));
    }

    #[test]
    fn integral_numbers_drop_the_fraction() {
        assert_eq!(Cell::Number(1320222088828.0).as_text(), Some("1320222088828".into()));
        assert_eq!(Cell::Number(2.5).as_text(), Some("2.5".into()));
    }

    #[test]
    fn rows_are_addressed_by_normalized_header() {
        let sheet = Sheet::new(
            vec!["SN".into(), "Workstation Name".into(), "SN".into()],
            vec![vec![
                Cell::Text("A1".into()),
                Cell::Text("FI".into()),
                Cell::Text("shadow".into()),
            ]],
        );
        let row = sheet.rows().next().unwrap();
        assert_eq!(row.number, 2);
        assert_eq!(row.text("sn").as_deref(), Some("A1"));
        assert_eq!(row.text("workstation_name").as_deref(), Some("FI"));
        assert_eq!(row.cell("missing"), &Cell::Empty);
    }

    #[test]
    fn unreadable_workbook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"definitely not a zip archive").unwrap();
        assert!(matches!(read_sheet(&path), Err(IngestError::Workbook { .. })));
    }
}
