//! `leadflow run` command implementation
//!
//! Runs the whole pipeline and prints its report.

use crate::error::{CliError, Result};
use crate::output::{print_json, render_report};
use crate::progress::create_spinner;
use leadflow_pipeline::{Orchestrator, PipelineContext};
use tokio_util::sync::CancellationToken;

pub async fn run(ctx: PipelineContext, json: bool, cancel: &CancellationToken) -> Result<()> {
    let spinner = create_spinner("Running pipeline", json);
    let orchestrator = Orchestrator::new(ctx.clone());
    let report = orchestrator.run(cancel).await;
    spinner.finish_and_clear();
    ctx.pools.dispose_all().await;

    if json {
        print_json(&report)?;
    } else {
        print!("{}", render_report(&report));
    }

    if report.success {
        Ok(())
    } else {
        Err(CliError::RunFailed(
            report
                .error
                .unwrap_or_else(|| format!("pipeline ended in state {}", report.state)),
        ))
    }
}
