//! `leadflow reset` command implementation
//!
//! Clears the cache and metrics of this process. With `--purge` it also
//! deletes the cleaned CSV outputs so the next `status` starts from raw data.

use crate::error::Result;
use crate::output::print_json;
use leadflow_pipeline::{DatasetKind, Orchestrator, PipelineContext};
use tracing::info;

pub async fn run(ctx: PipelineContext, purge: bool, json: bool) -> Result<()> {
    let paths = ctx.config.paths.clone();
    let cleared = Orchestrator::new(ctx).reset();

    let mut removed = Vec::new();
    if purge {
        for kind in DatasetKind::ALL {
            let path = paths.clean_path(kind);
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_file(&path).await?;
                info!(path = %path.display(), "Removed cleaned output");
                removed.push(path.display().to_string());
            }
        }
    }

    if json {
        print_json(&serde_json::json!({
            "cleared_entries": cleared,
            "removed_files": removed,
        }))?;
    } else {
        println!("Cleared {cleared} cached entries.");
        for path in &removed {
            println!("Removed {path}");
        }
    }
    Ok(())
}
