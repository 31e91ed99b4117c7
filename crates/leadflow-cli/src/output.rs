//! Rendering of command results as terminal tables or JSON

use crate::error::Result;
use crate::progress::format_seconds;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use leadflow_common::{Table as DataTable, Value};
use leadflow_pipeline::orchestrator::DatabaseStatus;
use leadflow_pipeline::{
    BatchResult, ConnectionStatus, KeyIndicators, PipelineReport, SqlLoadReport, SqlPhase,
    StatusSnapshot,
};
use serde::Serialize;

/// Pretty JSON on stdout
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

pub fn render_report(report: &PipelineReport) -> String {
    let mut summary = new_table();
    summary.set_header(vec!["Run", "Value"]);
    summary.add_row(vec!["ID".to_string(), report.run_id.to_string()]);
    summary.add_row(vec!["State".to_string(), report.state.to_string()]);
    summary.add_row(vec!["Success".to_string(), yes_no(report.success).to_string()]);
    summary.add_row(vec!["Phases".to_string(), report.phases_completed.join(", ")]);
    summary.add_row(vec!["Datasets".to_string(), report.datasets_loaded.join(", ")]);
    summary.add_row(vec!["Optimizations".to_string(), report.optimizations.join(", ")]);
    summary.add_row(vec![
        "Fallback used".to_string(),
        yes_no(report.fallback_used).to_string(),
    ]);
    if let Some(original) = &report.original_error {
        summary.add_row(vec!["Fallback reason".to_string(), original.clone()]);
    }
    if let Some(error) = &report.error {
        summary.add_row(vec!["Error".to_string(), error.clone()]);
    }
    summary.add_row(vec!["Total time".to_string(), format_seconds(report.total_time)]);
    summary.add_row(vec![
        "Performance score".to_string(),
        format!("{:.1}", report.performance.performance_score),
    ]);

    let mut out = format!("{summary}\n");
    if let Some(cleaning) = &report.cleaning {
        out.push_str(&format!(
            "\nCleaning ({} of {} tasks, policy {}, {})\n",
            cleaning.success_count,
            cleaning.batch.len(),
            cleaning.policy,
            if cleaning.policy_met { "met" } else { "not met" },
        ));
        out.push_str(&render_batch(&cleaning.batch));
    }
    if let Some(sql) = &report.sql {
        out.push('\n');
        out.push_str(&render_sql_phase(sql));
    }
    if !report.performance.detailed_metrics.is_empty() {
        let mut timings = new_table();
        timings.set_header(vec!["Operation", "Time"]);
        for (op, secs) in &report.performance.detailed_metrics {
            timings.add_row(vec![op.clone(), format_seconds(*secs)]);
        }
        out.push_str(&format!("\nTimings\n{timings}\n"));
    }
    out
}

pub fn render_batch(batch: &BatchResult) -> String {
    let mut table = new_table();
    table.set_header(vec!["Task", "Result", "Rows", "Time", "Error"]);
    for result in batch.iter() {
        table.add_row(vec![
            result.name.clone(),
            if result.succeeded { "ok" } else { "failed" }.to_string(),
            result.rows_processed.to_string(),
            format!("{} ms", result.duration_ms),
            result.error.clone().unwrap_or_default(),
        ]);
    }
    format!("{table}\n")
}

fn render_sql_phase(phase: &SqlPhase) -> String {
    match phase {
        SqlPhase::Skipped { reason } => format!("SQL load skipped: {reason}\n"),
        SqlPhase::Loaded(report) => format!("SQL load\n{}", render_sql_report(report)),
        SqlPhase::Degraded { error, report } => {
            let mut out = format!("SQL load degraded: {error}\n");
            if let Some(report) = report {
                out.push_str(&render_sql_report(report));
            }
            out
        },
    }
}

fn render_sql_report(report: &SqlLoadReport) -> String {
    let mut table = new_table();
    table.set_header(vec!["Table", "Loaded", "Rows", "Error"]);
    for (name, load) in &report.tables {
        table.add_row(vec![
            name.clone(),
            yes_no(load.succeeded).to_string(),
            load.row_count.to_string(),
            load.error.clone().unwrap_or_default(),
        ]);
    }
    format!("{table}\n")
}

pub fn render_connection(status: &ConnectionStatus) -> String {
    let mut table = new_table();
    table.set_header(vec!["Database", "Value"]);
    table.add_row(vec!["DSN".to_string(), status.dsn.clone()]);
    table.add_row(vec!["Backend".to_string(), status.backend.to_string()]);
    table.add_row(vec!["Connected".to_string(), yes_no(status.connected).to_string()]);
    if let Some(error) = &status.error {
        table.add_row(vec!["Error".to_string(), error.clone()]);
    }
    format!("{table}\n")
}

pub fn render_status(status: &StatusSnapshot) -> String {
    let mut out = format!(
        "State: {}    Health: {}/{} ({:.1}%) {}\n\n",
        status.state,
        status.health.components_ok,
        status.health.components_total,
        status.health.percent,
        if status.health.healthy { "healthy" } else { "unhealthy" },
    );

    let mut datasets = new_table();
    datasets.set_header(vec!["Dataset", "Path", "On disk", "Cached"]);
    for (key, availability) in &status.datasets {
        datasets.add_row(vec![
            key.clone(),
            availability.path.display().to_string(),
            yes_no(availability.exists).to_string(),
            yes_no(availability.cached).to_string(),
        ]);
    }
    out.push_str(&format!("{datasets}\n"));

    if !status.cleaning.is_empty() {
        let mut cleaned = new_table();
        cleaned.set_header(vec!["Cleaned", "Rows", "Columns", "Completeness"]);
        for (key, stats) in &status.cleaning {
            cleaned.add_row(vec![
                key.clone(),
                stats.rows.to_string(),
                stats.columns.to_string(),
                format!("{:.1}%", stats.completeness_percent),
            ]);
        }
        out.push_str(&format!("\n{cleaned}\n"));
    }

    out.push('\n');
    match &status.database {
        DatabaseStatus::NotConfigured => out.push_str("Database: not configured\n"),
        DatabaseStatus::Checked(conn) => out.push_str(&render_connection(conn)),
    }

    out.push_str(&format!(
        "\nCache: {} entries, {} hits, {} misses ({:.1}% hit rate)\n",
        status.cache.entries,
        status.cache.hits,
        status.cache.misses,
        status.cache.hit_rate() * 100.0,
    ));

    if !status.pools.is_empty() {
        let mut pools = new_table();
        pools.set_header(vec!["Pool", "Backend", "Open", "Idle", "Max"]);
        for pool in &status.pools {
            pools.add_row(vec![
                pool.dsn.clone(),
                pool.backend.to_string(),
                pool.size.to_string(),
                pool.idle.to_string(),
                pool.max_connections.to_string(),
            ]);
        }
        out.push_str(&format!("\n{pools}\n"));
    }
    out
}

fn money(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("${v:.0}"))
}

pub fn render_indicators(indicators: &KeyIndicators) -> String {
    let mut table = new_table();
    table.set_header(vec!["Indicator", "Value"]);

    match &indicators.listings {
        Some(listings) => {
            table.add_row(vec![
                "Average price per m2".to_string(),
                money(listings.average_price_per_m2),
            ]);
            let reliability = &listings.reliability;
            table.add_row(vec![
                "Reliability rate".to_string(),
                format!(
                    "{:.1}% ({} of {} records complete)",
                    reliability.rate_percent, reliability.complete_records, reliability.total_records
                ),
            ]);
            let outliers = &listings.outliers;
            table.add_row(vec![
                "Price per m2 outliers".to_string(),
                format!(
                    "{} of {} (range {} to {})",
                    outliers.outliers,
                    outliers.analyzed,
                    money(outliers.lower_limit),
                    money(outliers.upper_limit)
                ),
            ]);
        },
        None => {
            table.add_row(vec!["Listings", "not cleaned yet"]);
        },
    }

    match &indicators.funnel {
        Some(funnel) => {
            table.add_row(vec![
                "Review address leads".to_string(),
                format!(
                    "{} (average {:.1} days)",
                    funnel.review_address.properties, funnel.review_address.average_days
                ),
            ]);
            table.add_row(vec![
                "Discarded".to_string(),
                format!(
                    "{:.1}% ({} of {} properties)",
                    funnel.discards.percent, funnel.discards.discarded, funnel.discards.total_properties
                ),
            ]);
            let initial = funnel.initial_state.as_ref().map_or_else(
                || "n/a".to_string(),
                |s| format!("{} ({:.1}%)", s.state, s.percent),
            );
            table.add_row(vec!["Most frequent initial state".to_string(), initial]);
        },
        None => {
            table.add_row(vec!["Status history", "not cleaned yet"]);
        },
    }

    format!("{table}\n")
}

/// Query results as a table, with NULL for missing values
pub fn render_rows(data: &DataTable) -> String {
    let mut table = new_table();
    table.set_header(data.columns().iter().map(|c| c.name.clone()).collect::<Vec<_>>());
    for row in data.rows() {
        table.add_row(
            row.iter()
                .map(|v| if v.is_null() { "NULL".to_string() } else { v.to_string() })
                .collect::<Vec<_>>(),
        );
    }
    format!("{table}\n")
}

/// Query results as a list of JSON objects keyed by column name
pub fn rows_to_json(data: &DataTable) -> serde_json::Value {
    let rows = data
        .rows()
        .iter()
        .map(|row| {
            let mut map = serde_json::Map::new();
            for (column, value) in data.columns().iter().zip(row) {
                let json = match value {
                    Value::Null => serde_json::Value::Null,
                    Value::Number(n) => serde_json::json!(n),
                    other => serde_json::Value::String(other.to_string()),
                };
                map.insert(column.name.clone(), json);
            }
            serde_json::Value::Object(map)
        })
        .collect();
    serde_json::Value::Array(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_common::{Column, ColumnKind};

    fn listing() -> DataTable {
        DataTable::from_rows(
            vec![
                Column::new("Id", ColumnKind::Number),
                Column::new("Ciudad", ColumnKind::Text),
            ],
            vec![
                vec![Value::Number(1.0), Value::text("Bogota")],
                vec![Value::Number(2.0), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_render_rows_marks_nulls() {
        let rendered = render_rows(&listing());
        assert!(rendered.contains("Ciudad"));
        assert!(rendered.contains("Bogota"));
        assert!(rendered.contains("NULL"));
    }

    #[test]
    fn test_render_indicators_marks_missing_datasets() {
        let rendered = render_indicators(&KeyIndicators::default());
        assert!(rendered.contains("Listings"));
        assert!(rendered.contains("not cleaned yet"));
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(Some(4_250_000.4)), "$4250000");
        assert_eq!(money(None), "n/a");
    }

    #[test]
    fn test_rows_to_json_keeps_types() {
        let json = rows_to_json(&listing());
        assert_eq!(json[0]["Id"], serde_json::json!(1.0));
        assert_eq!(json[0]["Ciudad"], serde_json::json!("Bogota"));
        assert!(json[1]["Ciudad"].is_null());
    }
}
