//! `leadflow status` command implementation

use crate::error::Result;
use crate::output::{print_json, render_status};
use leadflow_pipeline::{Orchestrator, PipelineContext};
use tokio_util::sync::CancellationToken;

/// Show dataset availability, cache and database health
pub async fn run(ctx: PipelineContext, json: bool, cancel: &CancellationToken) -> Result<()> {
    let snapshot = Orchestrator::new(ctx.clone()).status(cancel).await;
    ctx.pools.dispose_all().await;

    if json {
        print_json(&snapshot)?;
    } else {
        print!("{}", render_status(&snapshot));
    }
    Ok(())
}
