//! LeadFlow pipeline core
//!
//! Cleans the two real-estate lead datasets (listings and status history)
//! and loads them into SQL:
//!
//! - [`cache`]: shared dataset cache with single-flight loading
//! - [`pool`]: connection pools keyed by DSN
//! - [`executor`]: bounded parallel task execution with success policies
//! - [`metrics`]: named timers and the performance summary
//! - [`loader`], [`cleaner`], [`sql`]: the three pipeline phases
//! - [`orchestrator`]: runs the phases, with a sequential fallback
//! - [`indicators`]: key business indicators over the cleaned datasets
//!
//! Everything a run needs is owned by a [`PipelineContext`].
//!
//! ```no_run
//! use leadflow_pipeline::{Orchestrator, PipelineConfig, PipelineContext};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = PipelineContext::new(PipelineConfig::load()?);
//! let report = Orchestrator::new(ctx).run(&CancellationToken::new()).await;
//! println!("success: {}", report.success);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cache;
pub mod cleaner;
pub mod config;
pub mod context;
pub mod datasets;
pub mod error;
pub mod executor;
pub mod indicators;
pub mod loader;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod rules;
pub mod sql;
pub mod validation;

pub use cache::{CacheStats, DatasetCache};
pub use cleaner::{CleanOutcome, ParallelCleaner, QualityReport};
pub use config::{DataPaths, PipelineConfig};
pub use context::PipelineContext;
pub use datasets::{DatasetKind, DatasetSource, Stage};
pub use error::{ConnectionError, PipelineError, Result};
pub use executor::{BatchResult, SuccessPolicy, Task, TaskExecutor, TaskOutcome, TaskResult};
pub use indicators::{IndicatorsCalculator, KeyIndicators};
pub use loader::{CsvTableReader, DatasetLoader, TableReader};
pub use metrics::{MetricsCollector, PerformanceSummary};
pub use orchestrator::{Orchestrator, PipelineReport, PipelineState, SqlPhase, StatusSnapshot};
pub use pool::{ConnectionPoolManager, PoolSettings};
pub use rules::{CleaningRule, SampleRules, StatusRules};
pub use sql::{ConnectionStatus, SqlExecutor, SqlLoadReport};
pub use validation::{DataValidator, FullValidation, ValidationReport};
