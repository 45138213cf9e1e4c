//! Tabular source loading.
//!
//! Reads `.csv` (comma separated), `.txt` (tab separated) and `.xlsx`
//! (first worksheet) files into an in-memory [`Table`] of typed cells.
//! The first row is always treated as the header.

use crate::errors::{DatasetError, Result};
use calamine::{open_workbook_auto, Data, DataType, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use std::cmp::Ordering;
use std::path::Path;

/// Timestamp layouts accepted for date columns, tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

/// Markers treated as missing values in text sources.
const MISSING_MARKERS: &[&str] = &["", "na", "n/a", "nan", "null", "none"];

/// Supported source file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Comma separated `.csv`
    Csv,
    /// Tab separated `.txt`
    Tsv,
    /// `.xlsx` workbook
    Excel,
}

impl SourceFormat {
    /// Detect the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "csv" => Ok(Self::Csv),
            "txt" => Ok(Self::Tsv),
            "xlsx" => Ok(Self::Excel),
            other => Err(DatasetError::UnsupportedFormat(if other.is_empty() {
                path.display().to_string()
            } else {
                format!(".{other}")
            })),
        }
    }

    /// Label recorded in metadata documents.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Csv | Self::Tsv => "CSV/TXT",
            Self::Excel => "Excel",
        }
    }
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Number(f64),
    Timestamp(NaiveDateTime),
    Text(String),
}

impl Cell {
    /// Classify a raw text value.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if MISSING_MARKERS.contains(&trimmed.to_ascii_lowercase().as_str()) {
            return Self::Missing;
        }
        if let Ok(n) = trimmed.parse::<f64>() {
            return if n.is_nan() { Self::Missing } else { Self::Number(n) };
        }
        if let Some(ts) = parse_timestamp(trimmed) {
            return Self::Timestamp(ts);
        }
        Self::Text(trimmed.to_string())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Text form used for frequency counting and previews.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Self::Missing => None,
            Self::Number(n) => Some(n.to_string()),
            Self::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Timestamp(_) => 0,
            Self::Number(_) => 1,
            Self::Text(_) => 2,
            Self::Missing => 3,
        }
    }

    /// Ascending order with missing values last.
    fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Parse a timestamp in any of the accepted layouts.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    for fmt in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Inferred column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Every present value is a number
    Numeric,
    /// Every present value is a timestamp
    Temporal,
    /// Text or mixed values
    Categorical,
    /// No present values at all
    Empty,
}

impl ColumnKind {
    /// Type name recorded in the feature list.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Numeric => "float64",
            Self::Temporal => "datetime64[ns]",
            Self::Categorical | Self::Empty => "object",
        }
    }
}

/// In-memory tabular data.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    /// Load a table from a supported source file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DatasetError::ArtifactNotFound(path.to_path_buf()));
        }

        let table = match SourceFormat::from_path(path)? {
            SourceFormat::Csv => Self::from_delimited(path, b',')?,
            SourceFormat::Tsv => Self::from_delimited(path, b'\t')?,
            SourceFormat::Excel => Self::from_excel(path)?,
        };

        tracing::debug!(
            path = %path.display(),
            rows = table.len(),
            columns = table.column_count(),
            "Loaded tabular source"
        );
        Ok(table)
    }

    fn from_delimited(path: &Path, delimiter: u8) -> Result<Self> {
        let source_err = |reason: String| DatasetError::Source {
            path: path.to_path_buf(),
            reason,
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| source_err(e.to_string()))?;

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| source_err(e.to_string()))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        if columns.is_empty() {
            return Err(source_err("missing header row".to_string()));
        }

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| source_err(format!("line {}: {e}", idx + 2)))?;
            let mut row: Vec<Cell> = record.iter().take(columns.len()).map(Cell::parse).collect();
            row.resize(columns.len(), Cell::Missing);
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    fn from_excel(path: &Path) -> Result<Self> {
        let source_err = |reason: String| DatasetError::Source {
            path: path.to_path_buf(),
            reason,
        };

        let mut workbook = open_workbook_auto(path).map_err(|e| source_err(e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| source_err("workbook has no worksheets".to_string()))?
            .map_err(|e| source_err(e.to_string()))?;

        let mut sheet_rows = range.rows();
        let columns: Vec<String> = match sheet_rows.next() {
            Some(header) => header
                .iter()
                .map(|cell| match cell {
                    Data::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .collect(),
            None => return Err(source_err("missing header row".to_string())),
        };

        let rows = sheet_rows
            .map(|row| {
                let mut cells: Vec<Cell> = row.iter().take(columns.len()).map(excel_cell).collect();
                cells.resize(columns.len(), Cell::Missing);
                cells
            })
            .collect();

        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Index of a named column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cells of one column, top to bottom.
    pub fn column(&self, idx: usize) -> impl Iterator<Item = &Cell> + '_ {
        self.rows.iter().map(move |row| &row[idx])
    }

    /// Infer the type of a column from its present values.
    pub fn column_kind(&self, idx: usize) -> ColumnKind {
        let mut present = self.column(idx).filter(|c| !c.is_missing()).peekable();
        if present.peek().is_none() {
            return ColumnKind::Empty;
        }

        let mut all_numeric = true;
        let mut all_temporal = true;
        for cell in present {
            all_numeric &= matches!(cell, Cell::Number(_));
            all_temporal &= matches!(cell, Cell::Timestamp(_));
        }

        if all_numeric {
            ColumnKind::Numeric
        } else if all_temporal {
            ColumnKind::Temporal
        } else {
            ColumnKind::Categorical
        }
    }

    /// Stable ascending sort on one column, missing values last.
    pub fn sort_by_column(&mut self, idx: usize) {
        self.rows.sort_by(|a, b| a[idx].sort_cmp(&b[idx]));
    }

    /// Coerce a column to numbers. Missing cells become `None`; any text or
    /// timestamp cell is a hard error.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| DatasetError::Configuration(format!("column '{name}' not found")))?;

        self.column(idx)
            .enumerate()
            .map(|(row, cell)| match cell {
                Cell::Missing => Ok(None),
                Cell::Number(n) => Ok(Some(*n)),
                other => Err(DatasetError::NonNumeric {
                    column: name.to_string(),
                    detail: format!("row {row}: {:?}", other),
                }),
            })
            .collect()
    }

    /// Parsed timestamps of a column, skipping cells that are not timestamps.
    pub fn timestamps(&self, idx: usize) -> Vec<NaiveDateTime> {
        self.column(idx)
            .filter_map(|cell| match cell {
                Cell::Timestamp(ts) => Some(*ts),
                _ => None,
            })
            .collect()
    }

    /// A copy of the first `n` rows.
    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }
}

fn excel_cell(cell: &Data) -> Cell {
    match cell {
        Data::Empty => Cell::Missing,
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) if f.is_nan() => Cell::Missing,
        Data::Float(f) => Cell::Number(*f),
        Data::String(s) => Cell::parse(s),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(_) | Data::DateTimeIso(_) => {
            cell.as_datetime().map(Cell::Timestamp).unwrap_or(Cell::Missing)
        }
        _ => Cell::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn create_test_csv() -> std::io::Result<NamedTempFile> {
        let mut file = Builder::new().suffix(".csv").tempfile()?;
        writeln!(file, "date,sales,store")?;
        writeln!(file, "2024-01-03,30,north")?;
        writeln!(file, "2024-01-01,10,south")?;
        writeln!(file, ",,north")?;
        writeln!(file, "2024-01-02,NaN,north")?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn test_cell_parse() {
        assert_eq!(Cell::parse("1.5"), Cell::Number(1.5));
        assert_eq!(Cell::parse(" NaN "), Cell::Missing);
        assert_eq!(Cell::parse(""), Cell::Missing);
        assert_eq!(Cell::parse("abc"), Cell::Text("abc".into()));
        assert!(matches!(Cell::parse("2024-02-01 10:00:00"), Cell::Timestamp(_)));
        assert!(matches!(Cell::parse("inf"), Cell::Number(n) if n.is_infinite()));
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(SourceFormat::from_path(Path::new("a.CSV")).unwrap(), SourceFormat::Csv);
        assert_eq!(SourceFormat::from_path(Path::new("a.txt")).unwrap(), SourceFormat::Tsv);
        assert_eq!(SourceFormat::from_path(Path::new("a.xlsx")).unwrap(), SourceFormat::Excel);
        assert!(matches!(
            SourceFormat::from_path(Path::new("a.parquet")),
            Err(DatasetError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_csv_and_sort() {
        let file = create_test_csv().unwrap();
        let mut table = Table::load(file.path()).unwrap();

        assert_eq!(table.len(), 4);
        assert_eq!(table.columns, vec!["date", "sales", "store"]);
        assert_eq!(table.column_kind(0), ColumnKind::Temporal);
        assert_eq!(table.column_kind(1), ColumnKind::Numeric);
        assert_eq!(table.column_kind(2), ColumnKind::Categorical);

        table.sort_by_column(0);
        let sales = table.numeric_column("sales").unwrap();
        assert_eq!(sales, vec![Some(10.0), None, Some(30.0), None]);
        assert!(table.rows[3][0].is_missing());
    }

    #[test]
    fn test_load_tab_separated() {
        let mut file = Builder::new().suffix(".txt").tempfile().unwrap();
        writeln!(file, "date\tvalue").unwrap();
        writeln!(file, "2024-01-01\t1").unwrap();
        writeln!(file, "2024-01-02\t2").unwrap();
        file.flush().unwrap();

        let table = Table::load(file.path()).unwrap();
        assert_eq!(table.column_count(), 2);
        assert_eq!(table.numeric_column("value").unwrap(), vec![Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_non_numeric_target_fails() {
        let file = create_test_csv().unwrap();
        let table = Table::load(file.path()).unwrap();
        assert!(matches!(
            table.numeric_column("store"),
            Err(DatasetError::NonNumeric { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = Table::load("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, DatasetError::ArtifactNotFound(_)));
    }
}
