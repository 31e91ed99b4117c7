//! Structural and quality checks for datasets
//!
//! Nothing here blocks the pipeline: findings are returned as reports and
//! logged by the caller.

use crate::datasets::DatasetKind;
use leadflow_common::{ColumnKind, Table};
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_COMPLETENESS_THRESHOLD: f64 = 90.0;
pub const DEFAULT_IQR_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub dataset_name: String,
    /// Non-null cells over all cells, one decimal
    pub completeness_percent: f64,
    pub duplicate_count: usize,
    pub outlier_count_by_column: BTreeMap<String, usize>,
    pub structural_issues: Vec<String>,
    pub row_count: usize,
    pub column_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnHealth {
    pub exists: bool,
    pub null_count: usize,
    pub null_percent: f64,
}

/// Everything the validator knows about one dataset
#[derive(Debug, Clone, Serialize)]
pub struct FullValidation {
    pub report: ValidationReport,
    pub critical_columns: BTreeMap<String, ColumnHealth>,
    pub issues: Vec<String>,
    pub passed: bool,
}

#[derive(Debug, Clone)]
pub struct DataValidator {
    completeness_threshold: f64,
    iqr_factor: f64,
}

impl Default for DataValidator {
    fn default() -> Self {
        Self {
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            iqr_factor: DEFAULT_IQR_FACTOR,
        }
    }
}

impl DataValidator {
    pub fn new(completeness_threshold: f64, iqr_factor: f64) -> Self {
        Self {
            completeness_threshold,
            iqr_factor,
        }
    }

    /// Emptiness and missing expected columns for a known dataset kind.
    pub fn validate_structure(&self, table: &Table, kind: Option<DatasetKind>) -> Vec<String> {
        let mut issues = Vec::new();
        if table.is_empty() {
            issues.push("Dataset is empty".to_string());
        }
        if let Some(kind) = kind {
            let missing: Vec<&str> = kind
                .expected_columns()
                .iter()
                .copied()
                .filter(|c| !table.has_column(c))
                .collect();
            if !missing.is_empty() {
                issues.push(format!("Missing columns: {}", missing.join(", ")));
            }
        }
        issues
    }

    /// Completeness, duplicates and IQR outliers, plus structural issues when
    /// the kind is known.
    pub fn quality_report(
        &self,
        table: &Table,
        name: &str,
        kind: Option<DatasetKind>,
    ) -> ValidationReport {
        let outliers = table
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ColumnKind::Number)
            .map(|(idx, c)| (c.name.clone(), self.outlier_count(&table.numeric_values(idx))))
            .collect();

        ValidationReport {
            dataset_name: name.to_string(),
            completeness_percent: completeness_percent(table),
            duplicate_count: table.duplicate_row_count(),
            outlier_count_by_column: outliers,
            structural_issues: self.validate_structure(table, kind),
            row_count: table.row_count(),
            column_count: table.column_count(),
        }
    }

    pub fn critical_columns(&self, table: &Table, columns: &[&str]) -> BTreeMap<String, ColumnHealth> {
        columns
            .iter()
            .map(|name| {
                let health = match table.column_index(name) {
                    Some(idx) => {
                        let nulls = table.null_count(idx);
                        ColumnHealth {
                            exists: true,
                            null_count: nulls,
                            null_percent: percent(nulls, table.row_count()),
                        }
                    },
                    None => ColumnHealth {
                        exists: false,
                        null_count: 0,
                        null_percent: 0.0,
                    },
                };
                (name.to_string(), health)
            })
            .collect()
    }

    /// Quality report, critical columns and the completeness threshold check.
    pub fn full_report(&self, table: &Table, name: &str, kind: DatasetKind) -> FullValidation {
        let report = self.quality_report(table, name, Some(kind));
        let critical_columns = self.critical_columns(table, kind.critical_columns());

        let mut issues = report.structural_issues.clone();
        if report.completeness_percent < self.completeness_threshold {
            issues.push(format!(
                "Completeness {:.1}% below {:.1}%",
                report.completeness_percent, self.completeness_threshold
            ));
        }
        for (column, health) in &critical_columns {
            if !health.exists {
                issues.push(format!("Critical column {column} missing"));
            }
        }

        FullValidation {
            passed: issues.is_empty(),
            report,
            critical_columns,
            issues,
        }
    }

    fn outlier_count(&self, values: &[f64]) -> usize {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let (Some(q1), Some(q3)) = (quantile(&sorted, 0.25), quantile(&sorted, 0.75)) else {
            return 0;
        };
        let spread = (q3 - q1) * self.iqr_factor;
        let (low, high) = (q1 - spread, q3 + spread);
        sorted.iter().filter(|v| **v < low || **v > high).count()
    }
}

/// Linear-interpolated quantile of already sorted values.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

fn completeness_percent(table: &Table) -> f64 {
    let cells = table.cell_count();
    if cells == 0 {
        return 0.0;
    }
    let filled = cells - table.total_null_count();
    round1(filled as f64 / cells as f64 * 100.0)
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round1(part as f64 / whole as f64 * 100.0)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
