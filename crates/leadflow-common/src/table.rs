//! Typed in-memory tables
//!
//! A [`Table`] is an ordered list of typed columns plus fixed-width rows. It is
//! the only shape the loader, cleaner, validator and SQL executor exchange.
//! Tables handed to other components are wrapped in `Arc` and never mutated
//! afterwards; cleaning always works on an owned copy.

use crate::error::{CommonError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Cell contents that count as missing when read from text.
pub const NULL_MARKERS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NaN", "nan", "NULL", "null", "None", "#N/A",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Number,
    Date,
}

impl ColumnKind {
    pub fn as_str(&self) -> &str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Number => "number",
            ColumnKind::Date => "date",
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Number)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Date)
    }
}

/// A single cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Date(NaiveDateTime),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// NaN numbers are treated as missing, like an empty cell.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Number(n) => n.is_nan(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn is_null_marker(raw: &str) -> bool {
        NULL_MARKERS.contains(&raw.trim())
    }

    /// Parses a finite number; thousands separators are not accepted.
    pub fn parse_number(raw: &str) -> Option<f64> {
        raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
    }

    pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
        let raw = raw.trim();
        DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .or_else(|| {
                DATE_FORMATS.iter().find_map(|fmt| {
                    NaiveDate::parse_from_str(raw, fmt)
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
            })
    }

    /// Converts a raw text cell into a value of the given kind.
    /// Returns `Null` when the text does not parse.
    pub fn parse_as(raw: &str, kind: ColumnKind) -> Value {
        if Self::is_null_marker(raw) {
            return Value::Null;
        }
        match kind {
            ColumnKind::Text => Value::Text(raw.to_string()),
            ColumnKind::Number => Self::parse_number(raw).map_or(Value::Null, Value::Number),
            ColumnKind::Date => Self::parse_date(raw).map_or(Value::Null, Value::Date),
        }
    }

    /// Coerces to a number; anything that does not parse becomes `Null`.
    pub fn to_number(&self) -> Value {
        match self {
            Value::Number(n) if n.is_finite() => Value::Number(*n),
            Value::Text(s) => Value::parse_as(s, ColumnKind::Number),
            _ => Value::Null,
        }
    }

    /// Coerces to a date; anything that does not parse becomes `Null`.
    pub fn to_date(&self) -> Value {
        match self {
            Value::Date(d) => Value::Date(*d),
            Value::Text(s) => Value::parse_as(s, ColumnKind::Date),
            _ => Value::Null,
        }
    }

    /// Stable identity used for duplicate detection.
    fn identity(&self) -> String {
        match self {
            Value::Null => "\u{0}".to_string(),
            Value::Number(n) if n.is_nan() => "\u{0}".to_string(),
            Value::Text(s) => format!("t:{s}"),
            Value::Number(n) => format!("n:{}", n.to_bits()),
            Value::Date(d) => format!("d:{}", d.and_utc().timestamp()),
        }
    }

    fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Value>()
            + match self {
                Value::Text(s) => s.capacity(),
                _ => 0,
            }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(n) if n.is_nan() => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{n}"),
            Value::Date(d) => {
                if d.time() == chrono::NaiveTime::MIN {
                    write!(f, "{}", d.format("%Y-%m-%d"))
                } else {
                    write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S"))
                }
            },
        }
    }
}

fn row_identity(row: &[Value]) -> String {
    row.iter()
        .map(Value::identity)
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Ordered, typed columns plus fixed-width rows
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Creates an empty table. Column names must be unique.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(CommonError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn from_rows(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut table = Self::new(columns)?;
        table.rows.reserve(rows.len());
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(CommonError::RowWidth {
                row: self.rows.len(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn cell_count(&self) -> usize {
        self.row_count() * self.column_count()
    }

    /// A table is empty when it has no rows, whatever its columns.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().filter_map(move |row| row.get(idx))
    }

    /// Finite numbers of a column, in row order.
    pub fn numeric_values(&self, idx: usize) -> Vec<f64> {
        self.column_values(idx).filter_map(Value::as_f64).collect()
    }

    pub fn null_count(&self, idx: usize) -> usize {
        self.column_values(idx).filter(|v| v.is_null()).count()
    }

    pub fn total_null_count(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .filter(|v| v.is_null())
            .count()
    }

    /// Rows that exactly repeat an earlier row.
    pub fn duplicate_row_count(&self) -> usize {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows
            .iter()
            .filter(|row| !seen.insert(row_identity(row)))
            .count()
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[Value]) -> bool,
    {
        self.rows.retain(|row| keep(row));
    }

    /// Drops rows whose value in `column` was already seen, keeping the first.
    /// Returns the number of rows removed.
    pub fn dedup_by_column(&mut self, column: &str) -> Result<usize> {
        let idx = self.require_column(column)?;
        let before = self.rows.len();
        let mut seen = HashSet::with_capacity(before);
        self.rows.retain(|row| seen.insert(row[idx].identity()));
        Ok(before - self.rows.len())
    }

    /// Rewrites every cell of `column` and declares its new kind.
    pub fn map_column<F>(&mut self, column: &str, kind: ColumnKind, mut f: F) -> Result<()>
    where
        F: FnMut(&Value) -> Value,
    {
        let idx = self.require_column(column)?;
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        self.columns[idx].kind = kind;
        Ok(())
    }

    /// Rough heap footprint, for cache reporting.
    pub fn approx_bytes(&self) -> usize {
        let columns: usize = self
            .columns
            .iter()
            .map(|c| std::mem::size_of::<Column>() + c.name.capacity())
            .sum();
        let cells: usize = self
            .rows
            .iter()
            .map(|row| {
                std::mem::size_of::<Vec<Value>>()
                    + row.iter().map(Value::approx_bytes).sum::<usize>()
            })
            .sum();
        columns + cells
    }

    fn require_column(&self, column: &str) -> Result<usize> {
        self.column_index(column)
            .ok_or_else(|| CommonError::UnknownColumn(column.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_rows(
            vec![Column::number("Id"), Column::text("Ciudad")],
            vec![
                vec![Value::Number(1.0), Value::text("Bogota")],
                vec![Value::Number(2.0), Value::Null],
                vec![Value::Number(1.0), Value::text("Bogota")],
                vec![Value::Number(1.0), Value::text("Cali")],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_wrong_row_width() {
        let err = Table::from_rows(
            vec![Column::text("a"), Column::text("b")],
            vec![vec![Value::Null]],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CommonError::RowWidth {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_duplicate_column() {
        let err = Table::new(vec![Column::text("a"), Column::number("a")]).unwrap_err();
        assert!(matches!(err, CommonError::DuplicateColumn(name) if name == "a"));
    }

    #[test]
    fn test_duplicates_and_nulls() {
        let table = sample();
        assert_eq!(table.duplicate_row_count(), 1);
        assert_eq!(table.null_count(1), 1);
        assert_eq!(table.total_null_count(), 1);
        assert_eq!(table.cell_count(), 8);
    }

    #[test]
    fn test_dedup_by_column_keeps_first() {
        let mut table = sample();
        let removed = table.dedup_by_column("Id").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "Ciudad"), Some(&Value::text("Bogota")));
        assert!(table.dedup_by_column("Missing").is_err());
    }

    #[test]
    fn test_map_column_changes_kind() {
        let mut table = Table::from_rows(
            vec![Column::text("Precio")],
            vec![vec![Value::text("100")], vec![Value::text("abc")]],
        )
        .unwrap();
        table
            .map_column("Precio", ColumnKind::Number, Value::to_number)
            .unwrap();
        assert_eq!(table.columns()[0].kind, ColumnKind::Number);
        assert_eq!(table.rows()[0][0], Value::Number(100.0));
        assert!(table.rows()[1][0].is_null());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(Value::parse_number(" 12.5 "), Some(12.5));
        assert_eq!(Value::parse_number("inf"), None);
        assert!(Value::is_null_marker("NaN"));
        let d = Value::parse_date("2024-03-01").unwrap();
        assert_eq!(Value::Date(d).to_string(), "2024-03-01");
        let dt = Value::parse_date("2024-03-01 10:30:00").unwrap();
        assert_eq!(Value::Date(dt).to_string(), "2024-03-01 10:30:00");
        assert_eq!(Value::parse_as("x", ColumnKind::Date), Value::Null);
    }

    #[test]
    fn test_nan_is_null() {
        assert!(Value::Number(f64::NAN).is_null());
        assert_eq!(Value::Number(f64::NAN).to_string(), "");
        assert_eq!(Value::Number(3.0).to_string(), "3");
    }
}
