//! Executor types: tasks, per-task results and batch success policies

use crate::error::{PipelineError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

/// What a task reports back when it succeeds
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskOutcome {
    pub rows_processed: u64,
    /// Task-specific report
    pub payload: serde_json::Value,
}

impl TaskOutcome {
    pub fn new(rows_processed: u64, payload: serde_json::Value) -> Self {
        Self {
            rows_processed,
            payload,
        }
    }
}

/// A named unit of work for one batch
pub struct Task {
    pub name: String,
    /// Cache keys the task reads
    pub reads: Vec<String>,
    /// Cache keys the task writes
    pub writes: Vec<String>,
    pub(crate) work: BoxFuture<'static, Result<TaskOutcome>>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<TaskOutcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            work: work.boxed(),
        }
    }

    pub fn reads(mut self, key: impl Into<String>) -> Self {
        self.reads.push(key.into());
        self
    }

    pub fn writes(mut self, key: impl Into<String>) -> Self {
        self.writes.push(key.into());
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub name: String,
    pub succeeded: bool,
    pub rows_processed: u64,
    pub error: Option<String>,
    /// The task panicked or its runner was lost
    pub unexpected: bool,
    pub payload: serde_json::Value,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn from_outcome(name: String, outcome: Result<TaskOutcome>, elapsed: Duration) -> Self {
        let duration_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(outcome) => Self {
                name,
                succeeded: true,
                rows_processed: outcome.rows_processed,
                error: None,
                unexpected: false,
                payload: outcome.payload,
                duration_ms,
            },
            Err(err) => Self::failed(name, &err, duration_ms),
        }
    }

    pub fn failed(name: String, err: &PipelineError, duration_ms: u64) -> Self {
        Self {
            name,
            succeeded: false,
            rows_processed: 0,
            error: Some(err.to_string()),
            unexpected: err.is_unexpected(),
            payload: serde_json::Value::Null,
            duration_ms,
        }
    }
}

/// Results of one `run_all` call, keyed by task name
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    results: BTreeMap<String, TaskResult>,
}

impl BatchResult {
    pub(crate) fn new(results: BTreeMap<String, TaskResult>) -> Self {
        Self { results }
    }

    pub fn get(&self, name: &str) -> Option<&TaskResult> {
        self.results.get(name)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.results.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values()
    }

    pub fn success_count(&self) -> usize {
        self.iter().filter(|r| r.succeeded).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }

    pub fn has_unexpected_failures(&self) -> bool {
        self.iter().any(|r| r.unexpected)
    }

    pub fn total_rows(&self) -> u64 {
        self.iter().map(|r| r.rows_processed).sum()
    }

    pub fn satisfies(&self, policy: SuccessPolicy) -> bool {
        policy.is_met(self)
    }

    pub fn into_results(self) -> BTreeMap<String, TaskResult> {
        self.results
    }
}

/// When a batch with mixed outcomes counts as usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "min_rows")]
pub enum SuccessPolicy {
    /// Any task succeeded, or any task reported rows. Prefers partial data
    /// over none.
    #[default]
    Lenient,
    RequireAll,
    RequireAny,
    /// Succeeded tasks processed at least this many rows in total
    RequireMinRows(u64),
}

impl SuccessPolicy {
    /// An empty batch never satisfies a policy.
    pub fn is_met(&self, batch: &BatchResult) -> bool {
        if batch.is_empty() {
            return false;
        }
        match self {
            SuccessPolicy::Lenient => {
                batch.success_count() >= 1 || batch.iter().any(|r| r.rows_processed > 0)
            },
            SuccessPolicy::RequireAll => batch.failure_count() == 0,
            SuccessPolicy::RequireAny => batch.success_count() >= 1,
            SuccessPolicy::RequireMinRows(min) => {
                let rows: u64 = batch
                    .iter()
                    .filter(|r| r.succeeded)
                    .map(|r| r.rows_processed)
                    .sum();
                rows >= *min
            },
        }
    }
}

impl fmt::Display for SuccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessPolicy::Lenient => f.write_str("lenient"),
            SuccessPolicy::RequireAll => f.write_str("require_all"),
            SuccessPolicy::RequireAny => f.write_str("require_any"),
            SuccessPolicy::RequireMinRows(n) => write!(f, "min_rows:{n}"),
        }
    }
}

impl FromStr for SuccessPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "lenient" => Ok(SuccessPolicy::Lenient),
            "require_all" | "all" => Ok(SuccessPolicy::RequireAll),
            "require_any" | "any" => Ok(SuccessPolicy::RequireAny),
            other => other
                .strip_prefix("min_rows:")
                .or_else(|| other.strip_prefix("require_min_rows:"))
                .and_then(|n| n.trim().parse().ok())
                .map(SuccessPolicy::RequireMinRows)
                .ok_or_else(|| PipelineError::Config(format!("Unknown success policy: {s}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn result(name: &str, succeeded: bool, rows: u64) -> TaskResult {
        TaskResult {
            name: name.to_string(),
            succeeded,
            rows_processed: rows,
            error: (!succeeded).then(|| "failed".to_string()),
            unexpected: false,
            payload: serde_json::Value::Null,
            duration_ms: 0,
        }
    }

    fn batch(results: Vec<TaskResult>) -> BatchResult {
        BatchResult::new(results.into_iter().map(|r| (r.name.clone(), r)).collect())
    }

    #[test]
    fn test_lenient_accepts_partial_success() {
        let partial = batch(vec![result("a", true, 0), result("b", false, 0)]);
        assert!(partial.satisfies(SuccessPolicy::Lenient));
        assert!(partial.satisfies(SuccessPolicy::RequireAny));
        assert!(!partial.satisfies(SuccessPolicy::RequireAll));

        let rows_only = batch(vec![result("a", false, 12), result("b", false, 0)]);
        assert!(rows_only.satisfies(SuccessPolicy::Lenient));
        assert!(!rows_only.satisfies(SuccessPolicy::RequireAny));

        let nothing = batch(vec![result("a", false, 0)]);
        assert!(!nothing.satisfies(SuccessPolicy::Lenient));
        assert!(!BatchResult::default().satisfies(SuccessPolicy::Lenient));
    }

    #[test]
    fn test_min_rows_counts_successful_tasks_only() {
        let b = batch(vec![result("a", true, 40), result("b", false, 500)]);
        assert!(b.satisfies(SuccessPolicy::RequireMinRows(40)));
        assert!(!b.satisfies(SuccessPolicy::RequireMinRows(41)));
        assert_eq!(b.total_rows(), 540);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Lenient".parse::<SuccessPolicy>().unwrap(), SuccessPolicy::Lenient);
        assert_eq!(
            "require-all".parse::<SuccessPolicy>().unwrap(),
            SuccessPolicy::RequireAll
        );
        assert_eq!(
            "min_rows:100".parse::<SuccessPolicy>().unwrap(),
            SuccessPolicy::RequireMinRows(100)
        );
        assert!("most".parse::<SuccessPolicy>().is_err());
        assert_eq!(SuccessPolicy::RequireMinRows(5).to_string(), "min_rows:5");
    }
}
