//! LeadFlow Common Library
//!
//! Shared types, utilities, and error handling for the LeadFlow workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Tables**: the typed [`Table`] every pipeline stage exchanges
//! - **Table I/O**: CSV reading with column type inference, CSV writing and
//!   timestamped backups
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use leadflow_common::{io, Result};
//!
//! fn row_count(path: &str) -> Result<usize> {
//!     let table = io::read_csv(path)?;
//!     Ok(table.row_count())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod io;
pub mod logging;
pub mod table;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use table::{Column, ColumnKind, Table, Value};
