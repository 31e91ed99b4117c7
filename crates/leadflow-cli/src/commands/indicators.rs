//! `leadflow indicators` command implementation

use crate::error::{CliError, Result};
use crate::output::{print_json, render_indicators};
use leadflow_pipeline::{IndicatorsCalculator, PipelineContext, PipelineError};

/// Key business indicators over the cleaned datasets
pub async fn run(ctx: PipelineContext, json: bool) -> Result<()> {
    let indicators = match IndicatorsCalculator::new(ctx).calculate().await {
        Ok(indicators) => indicators,
        Err(PipelineError::MissingInput { .. }) => return Err(CliError::NotCleaned),
        Err(e) => return Err(e.into()),
    };

    if json {
        print_json(&indicators)?;
    } else {
        print!("{}", render_indicators(&indicators));
    }
    Ok(())
}
