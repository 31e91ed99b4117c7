//! Pipeline orchestration: load, clean in parallel, load into SQL
//!
//! ```text
//! Idle -> Loading -> Cleaning -> SqlLoading -> Done
//!                                          \-> Degraded (SQL problem, data is fine)
//! any phase -> Failed
//! ```
//!
//! Critical failures (nothing loaded, success policy not met because tasks
//! reported errors) end the run with a structured failure. Any other error
//! in the cleaning or SQL phases, including a panic or a task whose runner
//! was lost, reruns the pipeline once without the executor and without the
//! pool, and the original error is kept in the report. [`Orchestrator::run`] never
//! returns an error.

use crate::cache::CacheStats;
use crate::cleaner::{CleanOutcome, DatasetStatistics, ParallelCleaner};
use crate::context::PipelineContext;
use crate::datasets::{DatasetKind, Stage};
use crate::error::{PipelineError, Result};
use crate::executor::panic_message;
use crate::loader::{Availability, DatasetLoader};
use crate::metrics::PerformanceSummary;
use crate::pool::PoolStats;
use crate::sql::{ConnectionStatus, SqlExecutor, SqlLoadReport};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Loading,
    Cleaning,
    SqlLoading,
    Done,
    /// Data was cleaned but the SQL phase had problems
    Degraded,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Loading => "loading",
            PipelineState::Cleaning => "cleaning",
            PipelineState::SqlLoading => "sql_loading",
            PipelineState::Done => "done",
            PipelineState::Degraded => "degraded",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SqlPhase {
    Skipped {
        reason: String,
    },
    Loaded(SqlLoadReport),
    Degraded {
        error: String,
        report: Option<SqlLoadReport>,
    },
}

impl SqlPhase {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SqlPhase::Degraded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub success: bool,
    pub state: PipelineState,
    pub phases_completed: Vec<String>,
    pub datasets_loaded: Vec<String>,
    pub cleaning: Option<CleanOutcome>,
    pub sql: Option<SqlPhase>,
    pub performance: PerformanceSummary,
    pub optimizations: Vec<String>,
    pub fallback_used: bool,
    /// Error that triggered the sequential fallback
    pub original_error: Option<String>,
    pub error: Option<String>,
    /// Seconds
    pub total_time: f64,
    pub timestamp: DateTime<Utc>,
}

impl PipelineReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            success: false,
            state: PipelineState::Idle,
            phases_completed: Vec::new(),
            datasets_loaded: Vec::new(),
            cleaning: None,
            sql: None,
            performance: PerformanceSummary::default(),
            optimizations: Vec::new(),
            fallback_used: false,
            original_error: None,
            error: None,
            total_time: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn restart(&mut self) {
        self.phases_completed.clear();
        self.datasets_loaded.clear();
        self.cleaning = None;
        self.sql = None;
        self.optimizations.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatabaseStatus {
    NotConfigured,
    Checked(ConnectionStatus),
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub components_ok: usize,
    pub components_total: usize,
    pub percent: f64,
    /// At most one component may be down
    pub healthy: bool,
}

impl Health {
    fn from_checks(checks: &[bool]) -> Self {
        let total = checks.len();
        let ok = checks.iter().filter(|c| **c).count();
        Self {
            components_ok: ok,
            components_total: total,
            percent: if total == 0 {
                0.0
            } else {
                (ok as f64 / total as f64 * 1000.0).round() / 10.0
            },
            healthy: ok + 1 >= total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: PipelineState,
    pub datasets: BTreeMap<String, Availability>,
    pub cleaning: BTreeMap<String, DatasetStatistics>,
    pub database: DatabaseStatus,
    pub cache: CacheStats,
    pub pools: Vec<PoolStats>,
    pub health: Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Parallel,
    Sequential,
}

pub struct Orchestrator {
    ctx: PipelineContext,
    cleaner: ParallelCleaner,
    state: Mutex<PipelineState>,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self::with_cleaner(ctx.clone(), ParallelCleaner::new(ctx))
    }

    pub fn with_cleaner(ctx: PipelineContext, cleaner: ParallelCleaner) -> Self {
        Self {
            ctx,
            cleaner,
            state: Mutex::new(PipelineState::Idle),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        info!(state = %state, "Pipeline state changed");
    }

    /// Runs the whole pipeline and reports the outcome.
    pub async fn run(&self, cancel: &CancellationToken) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(run_id, cancel).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, cancel: &CancellationToken) -> PipelineReport {
        let started = Instant::now();
        let mut report = PipelineReport::new(run_id);
        info!(
            workers = self.ctx.config.max_workers,
            policy = %self.ctx.config.success_policy,
            "Pipeline started"
        );

        match self.run_phases(&mut report, Mode::Parallel, cancel).await {
            Ok(()) => {},
            Err(e) if !needs_fallback(&e) => self.fail(&mut report, e),
            Err(e) => {
                warn!(error = %e, "Unexpected failure, retrying sequentially");
                report.original_error = Some(e.to_string());
                report.fallback_used = true;
                report.restart();

                let fallback = self
                    .run_phases(&mut report, Mode::Sequential, cancel)
                    .instrument(info_span!("sequential_fallback"))
                    .await;
                if let Err(e) = fallback {
                    self.fail(&mut report, e);
                }
            },
        }

        report.performance = self.ctx.metrics.performance_summary();
        report.total_time = started.elapsed().as_secs_f64();
        report.timestamp = Utc::now();

        info!(
            success = report.success,
            state = %report.state,
            fallback = report.fallback_used,
            total_time = report.total_time,
            "Pipeline finished"
        );
        report
    }

    fn fail(&self, report: &mut PipelineReport, err: PipelineError) {
        error!(error = %err, "Pipeline failed");
        report.success = false;
        report.error = Some(err.to_string());
        report.state = PipelineState::Failed;
        self.set_state(PipelineState::Failed);
    }

    async fn run_phases(&self, report: &mut PipelineReport, mode: Mode, cancel: &CancellationToken) -> Result<()> {
        // Loading
        self.set_state(PipelineState::Loading);
        {
            let _timer = self.ctx.metrics.timer("data_load");
            let loaded = DatasetLoader::new(self.ctx.clone())
                .load_all(cancel)
                .instrument(info_span!("data_load"))
                .await?;
            if loaded.is_empty() {
                return Err(PipelineError::critical("No datasets could be loaded"));
            }
            report.datasets_loaded = loaded.keys().cloned().collect();
        }
        report.phases_completed.push("data_load".to_string());
        report.optimizations.push("dataset_cache".to_string());

        // Cleaning
        self.set_state(PipelineState::Cleaning);
        let outcome = match mode {
            Mode::Parallel => {
                let _timer = self.ctx.metrics.timer("parallel_clean");
                let work = self
                    .cleaner
                    .run(false, cancel)
                    .instrument(info_span!("parallel_clean"));
                catch_phase_panic("parallel_clean", work).await?
            },
            Mode::Sequential => {
                let _timer = self.ctx.metrics.timer("sequential_clean");
                let work = self
                    .cleaner
                    .run_sequential(false, cancel)
                    .instrument(info_span!("sequential_clean"));
                catch_phase_panic("sequential_clean", work).await?
            },
        };
        let policy_met = outcome.policy_met;
        let unexpected = outcome.batch.has_unexpected_failures();
        let summary = format!(
            "{} of {} cleaning tasks succeeded under the {} policy",
            outcome.success_count,
            outcome.batch.len(),
            outcome.policy
        );
        report.cleaning = Some(outcome);
        if !policy_met {
            // Panicked or lost tasks get the sequential retry; task errors are final.
            if mode == Mode::Parallel && unexpected {
                return Err(PipelineError::task("parallel_clean", summary));
            }
            return Err(PipelineError::critical(summary));
        }
        report.phases_completed.push("clean".to_string());
        match mode {
            Mode::Parallel => report
                .optimizations
                .push(format!("parallel_cleaning ({} workers)", self.ctx.config.max_workers)),
            Mode::Sequential => report.optimizations.push("sequential_fallback".to_string()),
        }

        // SQL
        let sql = catch_phase_panic(
            "sql_load",
            self.sql_phase(mode, cancel).map(Ok).instrument(info_span!("sql_load")),
        )
        .await?;
        let degraded = sql.is_degraded();
        if matches!(sql, SqlPhase::Loaded(_)) {
            report.phases_completed.push("sql_load".to_string());
            if mode == Mode::Parallel {
                report.optimizations.push("connection_pooling".to_string());
            }
        }
        report.sql = Some(sql);

        let final_state = if degraded {
            PipelineState::Degraded
        } else {
            PipelineState::Done
        };
        report.success = true;
        report.error = None;
        report.state = final_state;
        self.set_state(final_state);
        Ok(())
    }

    async fn sql_phase(&self, mode: Mode, cancel: &CancellationToken) -> SqlPhase {
        let Some(sql) = SqlExecutor::from_context(&self.ctx) else {
            info!("DATABASE_URL not configured, skipping SQL load");
            return SqlPhase::Skipped {
                reason: "DATABASE_URL not configured".to_string(),
            };
        };

        let tables: BTreeMap<String, Arc<_>> = DatasetKind::ALL
            .iter()
            .filter_map(|kind| {
                let key = kind.cache_key(Stage::Clean);
                self.ctx.cache.get(key).map(|t| (key.to_string(), t))
            })
            .collect();
        if tables.is_empty() {
            return SqlPhase::Skipped {
                reason: "No cleaned datasets to load".to_string(),
            };
        }

        self.set_state(PipelineState::SqlLoading);
        let _timer = self.ctx.metrics.timer("sql_load");
        let report = match mode {
            Mode::Parallel => {
                let status = sql.verify_connection(cancel).await;
                if let Some(error) = status.error {
                    warn!(error = %error, "SQL phase degraded");
                    return SqlPhase::Degraded { error, report: None };
                }
                sql.load_tables(&tables, cancel).await
            },
            Mode::Sequential => sql.load_tables_unpooled(&tables).await,
        };

        if report.success {
            SqlPhase::Loaded(report)
        } else {
            let error = report
                .first_error()
                .unwrap_or("SQL load failed")
                .to_string();
            warn!(error = %error, "SQL phase degraded");
            SqlPhase::Degraded {
                error,
                report: Some(report),
            }
        }
    }

    /// Availability, cleaning statistics, database connectivity and cache
    /// state, with an overall health verdict.
    pub async fn status(&self, cancel: &CancellationToken) -> StatusSnapshot {
        let loader = DatasetLoader::new(self.ctx.clone());
        let datasets = loader.availability();
        let cleaning = self.cleaner.statistics();

        let database = match SqlExecutor::from_context(&self.ctx) {
            Some(sql) => DatabaseStatus::Checked(sql.verify_connection(cancel).await),
            None => DatabaseStatus::NotConfigured,
        };

        let raw_ok = DatasetKind::ALL
            .iter()
            .all(|kind| datasets.get(kind.cache_key(Stage::Raw)).is_some_and(|a| a.exists));
        let clean_ok = DatasetKind::ALL.iter().any(|kind| {
            datasets
                .get(kind.cache_key(Stage::Clean))
                .is_some_and(|a| a.exists || a.cached)
        });
        let db_ok = matches!(&database, DatabaseStatus::Checked(s) if s.connected);
        let cache = loader.cache_stats();

        StatusSnapshot {
            state: self.state(),
            health: Health::from_checks(&[raw_ok, clean_ok, db_ok, true]),
            datasets,
            cleaning,
            database,
            cache,
            pools: self.ctx.pools.stats(),
        }
    }

    /// Clears the cache and the collected metrics. Returns the number of
    /// cache entries dropped.
    pub fn reset(&self) -> usize {
        let cleared = self.ctx.cache.clear();
        self.ctx.metrics.reset();
        self.set_state(PipelineState::Idle);
        info!(cleared, "Pipeline reset");
        cleared
    }
}

/// Turns a panic inside a phase into an error the fallback can act on.
async fn catch_phase_panic<T>(phase: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(PipelineError::panicked(phase, panic_message(panic.as_ref()))))
}

/// Critical failures and cancellation are final; anything else earns one
/// sequential retry.
fn needs_fallback(err: &PipelineError) -> bool {
    !(err.is_critical() || err.is_cancelled())
}
