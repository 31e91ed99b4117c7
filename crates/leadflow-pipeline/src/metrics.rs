//! Named timers and the run's performance summary
//!
//! [`MetricsCollector::timer`] returns a guard that closes its timer when it
//! goes out of scope, including on early `?` returns. A guard dropped while
//! its thread unwinds from a panic clears the in-flight marker but records
//! nothing: only completed operations show up in [`MetricsCollector::metrics`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};

/// One completed timer or recorded value
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub operation: String,
    pub duration_seconds: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceSummary {
    pub total_execution_time: f64,
    pub operations_count: usize,
    pub average_operation_time: f64,
    /// 0-100, penalising two points per second of total time
    pub performance_score: f64,
    pub detailed_metrics: BTreeMap<String, f64>,
}

#[derive(Default)]
struct MetricsState {
    in_flight: HashMap<String, Instant>,
    completed: BTreeMap<String, f64>,
    samples: Vec<MetricSample>,
}

#[derive(Default)]
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a scoped timer for `operation`.
    pub fn timer(&self, operation: impl Into<String>) -> TimerGuard<'_> {
        let operation = operation.into();
        self.start_timer(&operation);
        TimerGuard {
            collector: self,
            operation,
            open: true,
        }
    }

    /// Starts (or restarts) the timer for `operation`.
    pub fn start_timer(&self, operation: &str) {
        let previous = self
            .state()
            .in_flight
            .insert(operation.to_string(), Instant::now());
        if previous.is_some() {
            warn!(operation, "Timer restarted before it was ended");
        }
    }

    /// Stops the timer and records its duration.
    /// Returns `None` when no timer for `operation` is running.
    pub fn end_timer(&self, operation: &str) -> Option<f64> {
        let mut state = self.state();
        let started = state.in_flight.remove(operation)?;
        let elapsed = started.elapsed().as_secs_f64();
        Self::store(&mut state, operation, elapsed);
        debug!(operation, seconds = elapsed, "Timer completed");
        Some(elapsed)
    }

    /// Stops the timer without recording anything.
    fn abandon_timer(&self, operation: &str) {
        if self.state().in_flight.remove(operation).is_some() {
            debug!(operation, "Timer abandoned");
        }
    }

    /// Stores an arbitrary value under `name`, replacing any previous one.
    pub fn record_metric(&self, name: &str, value: f64) {
        Self::store(&mut self.state(), name, value);
    }

    fn store(state: &mut MetricsState, operation: &str, value: f64) {
        state.completed.insert(operation.to_string(), value);
        state.samples.push(MetricSample {
            operation: operation.to_string(),
            duration_seconds: value,
            recorded_at: Utc::now(),
        });
    }

    pub fn is_running(&self, operation: &str) -> bool {
        self.state().in_flight.contains_key(operation)
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().in_flight.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the latest value per operation.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.state().completed.clone()
    }

    /// Every sample recorded so far, oldest first.
    pub fn samples(&self) -> Vec<MetricSample> {
        self.state().samples.clone()
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        let detailed_metrics = self.metrics();
        let total: f64 = detailed_metrics.values().sum();
        let count = detailed_metrics.len();
        let average = if count > 0 { total / count as f64 } else { 0.0 };

        PerformanceSummary {
            total_execution_time: total,
            operations_count: count,
            average_operation_time: average,
            performance_score: (100.0 - total * 2.0).clamp(0.0, 100.0),
            detailed_metrics,
        }
    }

    pub fn reset(&self) {
        *self.state() = MetricsState::default();
    }
}

/// Closes its timer on drop
#[must_use = "the timer stops as soon as the guard is dropped"]
pub struct TimerGuard<'a> {
    collector: &'a MetricsCollector,
    operation: String,
    open: bool,
}

impl TimerGuard<'_> {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Ends the timer now and returns the recorded duration.
    pub fn stop(mut self) -> Option<f64> {
        self.open = false;
        self.collector.end_timer(&self.operation)
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if std::thread::panicking() {
            self.collector.abandon_timer(&self.operation);
        } else {
            self.collector.end_timer(&self.operation);
        }
    }
}
