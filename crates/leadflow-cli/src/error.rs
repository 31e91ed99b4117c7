//! Error types for the LeadFlow CLI
//!
//! Messages are user-facing and say what to check next.

use leadflow_pipeline::PipelineError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Environment or flag configuration is invalid
    #[error("Configuration error: {0:#}. Check your environment variables and flags.")]
    Config(#[from] anyhow::Error),

    /// A command needs a database but none is configured
    #[error("No database configured. Set DATABASE_URL or pass --database-url.")]
    NoDatabase,

    /// Dataset name given on the command line is not known
    #[error("Unknown dataset '{0}'. Expected 'sample' or 'status'.")]
    UnknownDataset(String),

    /// Indicators need cleaned datasets
    #[error("No cleaned datasets found. Run `leadflow clean` first.")]
    NotCleaned,

    /// The pipeline ran but reported failure
    #[error("Pipeline failed: {0}")]
    RunFailed(String),

    /// A query produced no result
    #[error("Query '{0}' failed. Run with --verbose for the database error.")]
    QueryFailed(String),

    /// Database is configured but unreachable
    #[error("Database unreachable: {0}. Check that the server is running and the DSN is correct.")]
    Unreachable(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_actionable() {
        assert!(CliError::NoDatabase.to_string().contains("DATABASE_URL"));
        assert!(CliError::UnknownDataset("leads".into())
            .to_string()
            .contains("'sample' or 'status'"));
    }

    #[test]
    fn test_pipeline_errors_pass_through() {
        let err: CliError = PipelineError::Cancelled.into();
        assert_eq!(err.to_string(), "Operation cancelled");
    }
}
