//! `leadflow verify-db` and `leadflow tables` command implementations

use super::require_database;
use crate::error::{CliError, Result};
use crate::output::{print_json, render_connection};
use leadflow_pipeline::PipelineContext;
use tokio_util::sync::CancellationToken;

/// Check that the configured database answers `SELECT 1`
pub async fn verify(ctx: PipelineContext, json: bool, cancel: &CancellationToken) -> Result<()> {
    let executor = require_database(&ctx)?;
    let status = executor.verify_connection(cancel).await;
    ctx.pools.dispose_all().await;

    if json {
        print_json(&status)?;
    } else {
        print!("{}", render_connection(&status));
    }

    if status.connected {
        Ok(())
    } else {
        Err(CliError::Unreachable(status.error.unwrap_or(status.dsn)))
    }
}

/// List the tables in the configured database
pub async fn tables(ctx: PipelineContext, json: bool, cancel: &CancellationToken) -> Result<()> {
    let executor = require_database(&ctx)?;
    let listed = executor.list_tables(cancel).await;
    ctx.pools.dispose_all().await;
    let mut names = listed?;
    names.sort();

    if json {
        print_json(&names)?;
    } else if names.is_empty() {
        println!("No tables found.");
    } else {
        for name in &names {
            println!("{name}");
        }
    }
    Ok(())
}
