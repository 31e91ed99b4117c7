//! Error types for the pipeline core

use leadflow_common::CommonError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures reaching a database through the pool manager.
///
/// DSNs carried here are already redacted.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid connection string {dsn}: {source}")]
    InvalidDsn {
        dsn: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database unreachable at {dsn}: {source}")]
    Unreachable {
        dsn: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Connection acquisition cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Input for {key} not found at {}", path.display())]
    MissingInput { key: String, path: PathBuf },

    #[error("Failed to load {key}: {source}")]
    LoadFailure {
        key: String,
        #[source]
        source: CommonError,
    },

    #[error("Task {task} failed: {message}")]
    TaskFailure { task: String, message: String },

    #[error("Duplicate task name in batch: {0}")]
    DuplicateTask(String),

    #[error("Task {task} panicked: {message}")]
    Panicked { task: String, message: String },

    #[error("Task exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Table(#[from] CommonError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Critical pipeline failure: {0}")]
    Critical(String),
}

impl PipelineError {
    pub fn task(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailure {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn panicked(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Panicked {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::Critical(message.into())
    }

    /// Critical failures end the run with a structured failure; everything
    /// else reaching the orchestrator is unexpected and may be retried once
    /// sequentially.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }

    /// Panics and lost task runners, as opposed to a task reporting an error.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Panicked { .. } | Self::Join(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Connection(ConnectionError::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(PipelineError::critical("no datasets").is_critical());
        assert!(!PipelineError::task("clean_sample", "boom").is_critical());
        assert!(PipelineError::from(ConnectionError::Cancelled).is_cancelled());
        assert!(PipelineError::panicked("clean_sample", "index out of range").is_unexpected());
        assert!(!PipelineError::task("clean_sample", "boom").is_unexpected());
    }

    #[test]
    fn test_messages() {
        let err = PipelineError::MissingInput {
            key: "sample_raw".into(),
            path: PathBuf::from("data/muestra.csv"),
        };
        assert_eq!(
            err.to_string(),
            "Input for sample_raw not found at data/muestra.csv"
        );
        assert_eq!(
            PipelineError::task("clean_status", "no rows").to_string(),
            "Task clean_status failed: no rows"
        );
    }
}
