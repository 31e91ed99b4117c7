//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod clean;
pub mod db;
pub mod indicators;
pub mod query;
pub mod reset;
pub mod run;
pub mod status;

use crate::error::{CliError, Result};
use leadflow_pipeline::{PipelineContext, SqlExecutor};

/// SQL executor for commands that cannot work without a database.
pub(crate) fn require_database(ctx: &PipelineContext) -> Result<SqlExecutor> {
    SqlExecutor::from_context(ctx).ok_or(CliError::NoDatabase)
}
