//! `leadflow query` command implementation

use super::require_database;
use crate::error::{CliError, Result};
use crate::output::{print_json, render_rows, rows_to_json};
use leadflow_pipeline::PipelineContext;
use tokio_util::sync::CancellationToken;

/// Run one SQL statement and print the rows it returns
pub async fn run(
    ctx: PipelineContext,
    sql: &str,
    label: &str,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let executor = require_database(&ctx)?;
    let rows = executor.run_query(sql, label, cancel).await;
    ctx.pools.dispose_all().await;
    let rows = rows.ok_or_else(|| CliError::QueryFailed(label.to_string()))?;

    if json {
        print_json(&rows_to_json(&rows))?;
    } else if rows.column_count() == 0 {
        println!("Statement executed.");
    } else {
        print!("{}", render_rows(&rows));
        println!("{} rows", rows.row_count());
    }
    Ok(())
}
