//! Business cleaning rules for the two lead datasets
//!
//! A [`CleaningRule`] turns a raw table into a cleaned copy. The raw table is
//! never modified. Rules run on blocking threads, so they are plain
//! synchronous code.

use crate::datasets::DatasetKind;
use crate::validation::quantile;
use chrono::{Local, NaiveDateTime};
use leadflow_common::{ColumnKind, CommonError, Table, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// A cleaned table and what was removed on the way
#[derive(Debug, Clone)]
pub struct Cleaned {
    pub table: Table,
    pub counters: BTreeMap<String, usize>,
}

impl Cleaned {
    fn new(table: Table) -> Self {
        Self {
            table,
            counters: BTreeMap::new(),
        }
    }

    fn count(&mut self, name: &str, value: usize) {
        *self.counters.entry(name.to_string()).or_default() += value;
    }
}

pub trait CleaningRule: Send + Sync {
    fn kind(&self) -> DatasetKind;

    fn clean(&self, raw: &Table) -> Result<Cleaned, CommonError>;
}

/// Listing rules: dedup by `Id`, drop rows without `Id` or price, coerce
/// numeric fields, trim price to its 1st-99th percentile band, normalise
/// text fields to title case.
#[derive(Debug, Clone, Serialize)]
pub struct SampleRules {
    pub id_column: String,
    pub price_column: String,
    pub numeric_columns: Vec<String>,
    pub text_columns: Vec<String>,
    pub price_band: (f64, f64),
}

impl Default for SampleRules {
    fn default() -> Self {
        Self {
            id_column: "Id".to_string(),
            price_column: "Precio_Solicitado".to_string(),
            numeric_columns: ["Precio_Solicitado", "Area_Privada", "Habitaciones", "Banos"]
                .map(String::from)
                .to_vec(),
            text_columns: ["Tipo_Inmueble", "Ciudad", "Zona"].map(String::from).to_vec(),
            price_band: (0.01, 0.99),
        }
    }
}

impl CleaningRule for SampleRules {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Sample
    }

    fn clean(&self, raw: &Table) -> Result<Cleaned, CommonError> {
        let mut out = Cleaned::new(raw.clone());
        let table = &mut out.table;

        let duplicates = table.dedup_by_column(&self.id_column)?;

        let id = require(table, &self.id_column)?;
        let price = require(table, &self.price_column)?;
        let before = table.row_count();
        table.retain_rows(|row| !row[id].is_null() && !row[price].is_null());
        let missing_keys = before - table.row_count();

        for column in &self.numeric_columns {
            if table.has_column(column) {
                table.map_column(column, ColumnKind::Number, Value::to_number)?;
            }
        }

        let mut prices = table.numeric_values(price);
        prices.sort_by(f64::total_cmp);
        let before = table.row_count();
        if let (Some(low), Some(high)) = (
            quantile(&prices, self.price_band.0),
            quantile(&prices, self.price_band.1),
        ) {
            table.retain_rows(|row| row[price].as_f64().is_some_and(|p| p >= low && p <= high));
        } else {
            // Nothing numeric left to keep.
            table.retain_rows(|_| false);
        }
        let out_of_band = before - table.row_count();

        for column in &self.text_columns {
            if let Some(kind) = table.column(column).map(|c| c.kind) {
                let kind = if kind == ColumnKind::Number {
                    ColumnKind::Text
                } else {
                    kind
                };
                table.map_column(column, kind, normalize_text)?;
            }
        }

        out.count("duplicates_removed", duplicates);
        out.count("missing_keys_removed", missing_keys);
        out.count("price_outliers_removed", out_of_band);
        Ok(out)
    }
}

/// Status rules: drop incomplete rows, parse the update date, title-case the
/// status, drop dates in the future.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRules {
    pub date_column: String,
    pub status_column: String,
    /// Reference "now" for the future-date check; the local clock when unset
    pub now: Option<NaiveDateTime>,
}

impl Default for StatusRules {
    fn default() -> Self {
        Self {
            date_column: "Fecha_Actualizacion".to_string(),
            status_column: "Estado".to_string(),
            now: None,
        }
    }
}

impl StatusRules {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now: Some(now),
            ..Self::default()
        }
    }
}

impl CleaningRule for StatusRules {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Status
    }

    fn clean(&self, raw: &Table) -> Result<Cleaned, CommonError> {
        let mut out = Cleaned::new(raw.clone());
        let table = &mut out.table;

        let nulls_before = table.total_null_count();
        let before = table.row_count();
        table.retain_rows(|row| row.iter().all(|v| !v.is_null()));
        let incomplete = before - table.row_count();
        let nulls_removed = nulls_before - table.total_null_count();

        let mut unparsable = 0;
        let mut future = 0;
        if let Some(date) = table.column_index(&self.date_column) {
            table.map_column(&self.date_column, ColumnKind::Date, Value::to_date)?;
            let before = table.row_count();
            table.retain_rows(|row| !row[date].is_null());
            unparsable = before - table.row_count();

            let now = self.now.unwrap_or_else(|| Local::now().naive_local());
            let before = table.row_count();
            table.retain_rows(|row| row[date].as_date().is_some_and(|d| d <= now));
            future = before - table.row_count();
        }

        if table.has_column(&self.status_column) {
            table.map_column(&self.status_column, ColumnKind::Text, normalize_text)?;
        }

        out.count("incomplete_rows_removed", incomplete);
        out.count("nulls_removed", nulls_removed);
        out.count("unparsable_dates_removed", unparsable);
        out.count("future_dates_removed", future);
        Ok(out)
    }
}

/// Default rule for a dataset kind.
pub fn rule_for(kind: DatasetKind) -> Box<dyn CleaningRule> {
    match kind {
        DatasetKind::Sample => Box::new(SampleRules::default()),
        DatasetKind::Status => Box::new(StatusRules::default()),
    }
}

fn require(table: &Table, column: &str) -> Result<usize, CommonError> {
    table
        .column_index(column)
        .ok_or_else(|| CommonError::UnknownColumn(column.to_string()))
}

fn normalize_text(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        v if v.is_null() => Value::Null,
        other => Value::Text(title_case(other.to_string().trim())),
    }
}

/// Uppercases the first letter of every word and lowercases the rest.
/// Any non-letter starts a new word.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for ch in s.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use leadflow_common::Column;

    fn sample_raw() -> Table {
        let mut rows = Vec::new();
        for i in 1..=20 {
            rows.push(vec![
                Value::Number(i as f64),
                Value::text(format!("{}", 100 + i)),
                Value::text("  apartamento "),
                Value::text("BOGOTA"),
            ]);
        }
        // Duplicate id, missing price, non-numeric price, outlier price
        rows.push(vec![
            Value::Number(1.0),
            Value::text("150"),
            Value::text("casa"),
            Value::text("cali"),
        ]);
        rows.push(vec![
            Value::Number(21.0),
            Value::Null,
            Value::text("casa"),
            Value::text("cali"),
        ]);
        rows.push(vec![
            Value::Number(22.0),
            Value::text("consultar"),
            Value::text("casa"),
            Value::text("cali"),
        ]);
        rows.push(vec![
            Value::Number(23.0),
            Value::text("999999"),
            Value::text("casa"),
            Value::text("cali"),
        ]);
        Table::from_rows(
            vec![
                Column::number("Id"),
                Column::text("Precio_Solicitado"),
                Column::text("Tipo_Inmueble"),
                Column::text("Ciudad"),
            ],
            rows,
        )
        .unwrap()
    }

    #[test]
    fn test_sample_rules() {
        let raw = sample_raw();
        let cleaned = SampleRules::default().clean(&raw).unwrap();
        let table = &cleaned.table;

        assert_eq!(raw.row_count(), 24);
        assert_eq!(cleaned.counters["duplicates_removed"], 1);
        assert_eq!(cleaned.counters["missing_keys_removed"], 1);
        assert!(table.row_count() < 22);
        assert_eq!(table.column("Precio_Solicitado").unwrap().kind, ColumnKind::Number);
        assert!(table
            .rows()
            .iter()
            .all(|row| row[1].as_f64().is_some_and(|p| p < 999999.0)));
        assert_eq!(table.cell(0, "Tipo_Inmueble"), Some(&Value::text("Apartamento")));
        assert_eq!(table.cell(0, "Ciudad"), Some(&Value::text("Bogota")));
    }

    #[test]
    fn test_sample_rules_need_key_columns() {
        let table = Table::from_rows(vec![Column::number("Id")], vec![vec![Value::Number(1.0)]]).unwrap();
        let err = SampleRules::default().clean(&table).unwrap_err();
        assert!(matches!(err, CommonError::UnknownColumn(c) if c == "Precio_Solicitado"));
    }

    #[test]
    fn test_status_rules() {
        let now = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let raw = Table::from_rows(
            vec![
                Column::number("Inmueble_ID"),
                Column::text("Estado"),
                Column::text("Fecha_Actualizacion"),
            ],
            vec![
                vec![Value::Number(1.0), Value::text(" vendido"), Value::text("2024-01-10")],
                vec![Value::Number(2.0), Value::Null, Value::text("2024-01-11")],
                vec![Value::Number(3.0), Value::text("activo"), Value::text("2030-01-01")],
                vec![Value::Number(4.0), Value::text("activo"), Value::text("not a date")],
                vec![Value::Number(5.0), Value::text("EN VENTA"), Value::text("2024-05-31 10:00:00")],
            ],
        )
        .unwrap();

        let cleaned = StatusRules::at(now).clean(&raw).unwrap();
        let table = &cleaned.table;

        assert_eq!(table.row_count(), 2);
        assert_eq!(cleaned.counters["incomplete_rows_removed"], 1);
        assert_eq!(cleaned.counters["future_dates_removed"], 1);
        assert_eq!(cleaned.counters["unparsable_dates_removed"], 1);
        assert_eq!(table.cell(0, "Estado"), Some(&Value::text("Vendido")));
        assert_eq!(table.cell(1, "Estado"), Some(&Value::text("En Venta")));
        assert_eq!(table.column("Fecha_Actualizacion").unwrap().kind, ColumnKind::Date);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("  la candelaria  ".trim()), "La Candelaria");
        assert_eq!(title_case("APTO-DUPLEX"), "Apto-Duplex");
        assert_eq!(title_case("o'brien"), "O'Brien");
    }
}
