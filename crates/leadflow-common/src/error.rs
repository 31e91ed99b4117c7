//! Error types for LeadFlow

use thiserror::Error;

/// Result type alias for shared LeadFlow operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by table handling and table I/O
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Row {row} has {actual} cells, table has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}
