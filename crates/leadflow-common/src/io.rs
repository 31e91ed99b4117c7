//! CSV reading and writing for [`Table`]
//!
//! Column kinds are inferred on read: a column whose non-missing cells all
//! parse as numbers is numeric, one whose cells all parse as dates is a date
//! column, everything else is text. Missing cells (see
//! [`NULL_MARKERS`](crate::table::NULL_MARKERS)) become [`Value::Null`].

use crate::error::{CommonError, Result};
use crate::table::{Column, ColumnKind, Table, Value};
use chrono::{Local, NaiveDateTime};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Reads a headered CSV file into a typed table.
pub fn read_csv(path: impl AsRef<Path>) -> Result<Table> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            if h.is_empty() {
                format!("Unnamed: {i}")
            } else {
                h.to_string()
            }
        })
        .collect();

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record?;
        raw_rows.push(record.iter().map(str::to_string).collect());
    }

    let kinds: Vec<ColumnKind> = (0..headers.len())
        .map(|idx| infer_kind(raw_rows.iter().map(|row| row[idx].as_str())))
        .collect();

    let columns = headers
        .into_iter()
        .zip(kinds.iter())
        .map(|(name, kind)| Column::new(name, *kind))
        .collect();

    let rows = raw_rows
        .into_iter()
        .map(|row| {
            row.iter()
                .zip(kinds.iter())
                .map(|(raw, kind)| Value::parse_as(raw, *kind))
                .collect()
        })
        .collect();

    let table = Table::from_rows(columns, rows)?;
    debug!(
        path = %path.display(),
        rows = table.row_count(),
        columns = table.column_count(),
        "Read CSV"
    );
    Ok(table)
}

/// Picks the narrowest kind every non-missing cell parses as.
pub fn infer_kind<'a>(cells: impl Iterator<Item = &'a str>) -> ColumnKind {
    let mut seen_any = false;
    let mut all_numbers = true;
    let mut all_dates = true;

    for cell in cells.filter(|c| !Value::is_null_marker(c)) {
        seen_any = true;
        if all_numbers && Value::parse_number(cell).is_none() {
            all_numbers = false;
        }
        if all_dates && Value::parse_date(cell).is_none() {
            all_dates = false;
        }
        if !all_numbers && !all_dates {
            break;
        }
    }

    match (seen_any, all_numbers, all_dates) {
        (false, _, _) => ColumnKind::Text,
        (true, true, _) => ColumnKind::Number,
        (true, false, true) => ColumnKind::Date,
        _ => ColumnKind::Text,
    }
}

/// Writes a table as headered CSV, creating parent directories.
///
/// The file is written next to its destination and renamed into place, so a
/// reader never sees a half-written output.
pub fn write_csv(table: &Table, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| CommonError::InvalidPath(path.display().to_string()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(table.column_names())?;
        for row in table.rows() {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Backup location for `output`: `{stem}_backup_{YYYYmmdd_HHMMSS}{ext}` in `backup_dir`.
pub fn backup_path_for(
    output: impl AsRef<Path>,
    backup_dir: impl AsRef<Path>,
    at: NaiveDateTime,
) -> Result<PathBuf> {
    let output = output.as_ref();
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CommonError::InvalidPath(output.display().to_string()))?;
    let extension = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let name = format!("{stem}_backup_{}{extension}", at.format("%Y%m%d_%H%M%S"));
    Ok(backup_dir.as_ref().join(name))
}

/// Writes a timestamped backup copy of `table`, then the table itself to `output`.
/// Returns the backup path.
pub fn save_with_backup(
    table: &Table,
    output: impl AsRef<Path>,
    backup_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    let output = output.as_ref();
    let backup = backup_path_for(output, backup_dir, Local::now().naive_local())?;

    write_csv(table, &backup)?;
    info!(backup = %backup.display(), "Backup created");

    write_csv(table, output)?;
    info!(
        path = %output.display(),
        rows = table.row_count(),
        "Table saved"
    );
    Ok(backup)
}
