//! Bounded parallel task executor
//!
//! [`TaskExecutor::run_all`] runs a batch of named tasks on the tokio runtime,
//! at most `max_workers` at a time, and waits for all of them. Every task ends
//! up with exactly one [`TaskResult`]: errors, panics, timeouts and
//! cancellation are captured per task and never affect siblings.

pub mod types;

pub use types::{BatchResult, SuccessPolicy, Task, TaskOutcome, TaskResult};

use crate::error::{PipelineError, Result};
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sized to the two-dataset cleaning fan-out.
pub const DEFAULT_MAX_WORKERS: usize = 2;

#[derive(Debug, Clone)]
pub struct TaskExecutor {
    max_workers: usize,
    permits: Arc<Semaphore>,
    task_timeout: Option<Duration>,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl TaskExecutor {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            task_timeout: None,
        }
    }

    /// Fails any single task that runs longer than `timeout`.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs every task and returns one result per task name.
    ///
    /// Only a duplicate task name fails the call itself; it is rejected before
    /// anything starts.
    pub async fn run_all(&self, tasks: Vec<Task>, cancel: &CancellationToken) -> Result<BatchResult> {
        let mut names = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !names.insert(task.name.clone()) {
                return Err(PipelineError::DuplicateTask(task.name.clone()));
            }
        }

        info!(
            tasks = tasks.len(),
            max_workers = self.max_workers,
            "Running task batch"
        );

        let mut running = JoinSet::new();
        for task in tasks {
            let permits = Arc::clone(&self.permits);
            let cancel = cancel.clone();
            let timeout = self.task_timeout;
            debug!(task = %task.name, reads = ?task.reads, writes = ?task.writes, "Submitting task");

            running.spawn(async move {
                let started = Instant::now();
                let outcome = run_guarded(&task.name, task.work, permits, cancel, timeout).await;
                TaskResult::from_outcome(task.name, outcome, started.elapsed())
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(result) => {
                    if result.succeeded {
                        info!(
                            task = %result.name,
                            rows = result.rows_processed,
                            duration_ms = result.duration_ms,
                            "Task succeeded"
                        );
                    } else {
                        warn!(
                            task = %result.name,
                            error = result.error.as_deref().unwrap_or_default(),
                            "Task failed"
                        );
                    }
                    results.insert(result.name.clone(), result);
                },
                Err(e) => error!(error = %e, "Task runner aborted"),
            }
        }

        // A runner that died without reporting still owes its task a result.
        for name in names {
            if !results.contains_key(&name) {
                let err = PipelineError::panicked(&name, "task ended without reporting a result");
                results.insert(name.clone(), TaskResult::failed(name, &err, 0));
            }
        }

        Ok(BatchResult::new(results))
    }
}

async fn run_guarded(
    name: &str,
    work: futures::future::BoxFuture<'static, Result<TaskOutcome>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> Result<TaskOutcome> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        permit = permits.acquire_owned() => permit
            .map_err(|_| PipelineError::task("executor", "worker pool closed"))?,
    };

    let guarded = async move {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(PipelineError::panicked(name, panic_message(panic.as_ref()))),
        }
    };

    let bounded = async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .unwrap_or_else(|_| Err(PipelineError::Timeout(limit))),
            None => guarded.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        outcome = bounded => outcome,
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
