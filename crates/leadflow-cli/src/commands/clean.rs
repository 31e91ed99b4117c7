//! `leadflow clean` command implementation
//!
//! Cleans both datasets in parallel, or a single dataset when one is named.
//! Nothing is loaded into SQL.

use crate::error::{CliError, Result};
use crate::output::{print_json, render_batch};
use crate::progress::create_spinner;
use leadflow_pipeline::{DatasetKind, ParallelCleaner, PipelineContext};
use tokio_util::sync::CancellationToken;

pub async fn run(
    ctx: PipelineContext,
    dataset: Option<String>,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let cleaner = ParallelCleaner::new(ctx);

    match dataset {
        Some(name) => clean_single(&cleaner, &name, json, cancel).await,
        None => clean_all(&cleaner, json, cancel).await,
    }
}

async fn clean_single(
    cleaner: &ParallelCleaner,
    name: &str,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    if DatasetKind::from_name(name).is_none() {
        return Err(CliError::UnknownDataset(name.to_string()));
    }

    let spinner = create_spinner(&format!("Cleaning {name}"), json);
    let outcome = tokio::select! {
        outcome = cleaner.clean_one(name, cancel) => outcome,
        _ = cancel.cancelled() => Err(leadflow_pipeline::PipelineError::Cancelled),
    };
    spinner.finish_and_clear();
    let outcome = outcome?;

    if json {
        print_json(&outcome)?;
    } else {
        println!("Cleaned {name}: {} rows", outcome.rows_processed);
        println!("{}", serde_json::to_string_pretty(&outcome.payload)?);
    }
    Ok(())
}

async fn clean_all(cleaner: &ParallelCleaner, json: bool, cancel: &CancellationToken) -> Result<()> {
    let spinner = create_spinner("Cleaning datasets", json);
    let outcome = cleaner.run(true, cancel).await;
    spinner.finish_and_clear();
    let outcome = outcome?;

    if json {
        print_json(&outcome)?;
    } else {
        print!("{}", render_batch(&outcome.batch));
        if let Some(quality) = &outcome.quality {
            println!(
                "{} datasets cleaned, average completeness {:.1}%",
                quality.datasets_processed, quality.average_completeness
            );
        }
    }

    if outcome.policy_met {
        Ok(())
    } else {
        Err(CliError::RunFailed(format!(
            "{} of {} cleaning tasks succeeded under the {} policy",
            outcome.success_count,
            outcome.batch.len(),
            outcome.policy
        )))
    }
}
