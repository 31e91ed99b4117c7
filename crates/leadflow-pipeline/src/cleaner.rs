//! Parallel cleaning of the two lead datasets
//!
//! Each dataset gets one task on the [`TaskExecutor`](crate::executor::TaskExecutor):
//! read the raw table from cache, apply its [`CleaningRule`], score the
//! result, write it out with a backup and cache it under its clean key.

use crate::context::PipelineContext;
use crate::datasets::{DatasetKind, Stage};
use crate::error::{PipelineError, Result};
use crate::executor::{panic_message, BatchResult, SuccessPolicy, Task, TaskOutcome, TaskResult};
use crate::loader::DatasetLoader;
use crate::rules::{rule_for, CleaningRule};
use crate::validation::{DataValidator, FullValidation};
use futures::FutureExt;
use leadflow_common::io;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct CleanOutcome {
    pub batch: BatchResult,
    pub success_count: usize,
    pub policy: SuccessPolicy,
    pub policy_met: bool,
    /// Built only when the policy is met
    pub quality: Option<QualityReport>,
}

impl CleanOutcome {
    pub fn total_rows(&self) -> u64 {
        self.batch.total_rows()
    }
}

/// Post-clean quality over every cleaned dataset in cache
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub datasets: BTreeMap<String, FullValidation>,
    pub datasets_processed: usize,
    pub average_completeness: f64,
    /// Every dataset met the completeness threshold and has its critical columns
    pub all_passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStatistics {
    pub rows: usize,
    pub columns: usize,
    pub completeness_percent: f64,
}

pub struct ParallelCleaner {
    ctx: PipelineContext,
    rules: HashMap<DatasetKind, Arc<dyn CleaningRule>>,
    validator: DataValidator,
}

impl ParallelCleaner {
    pub fn new(ctx: PipelineContext) -> Self {
        let rules = DatasetKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::<dyn CleaningRule>::from(rule_for(*kind))))
            .collect();
        Self {
            ctx,
            rules,
            validator: DataValidator::default(),
        }
    }

    /// Replaces the rule for the rule's own dataset kind.
    pub fn with_rule(mut self, rule: Arc<dyn CleaningRule>) -> Self {
        self.rules.insert(rule.kind(), rule);
        self
    }

    fn rule(&self, kind: DatasetKind) -> Arc<dyn CleaningRule> {
        match self.rules.get(&kind) {
            Some(rule) => Arc::clone(rule),
            None => Arc::from(rule_for(kind)),
        }
    }

    /// Cleans both datasets concurrently, optionally loading them first.
    pub async fn run(&self, load_first: bool, cancel: &CancellationToken) -> Result<CleanOutcome> {
        if load_first {
            DatasetLoader::new(self.ctx.clone()).load_all(cancel).await?;
        }

        let tasks = DatasetKind::ALL
            .iter()
            .map(|kind| {
                Task::new(
                    kind.task_name(),
                    clean_dataset(
                        self.ctx.clone(),
                        self.rule(*kind),
                        self.validator.clone(),
                        cancel.clone(),
                    ),
                )
                .reads(kind.cache_key(Stage::Raw))
                .writes(kind.cache_key(Stage::Clean))
            })
            .collect();

        let batch = self.ctx.executor().run_all(tasks, cancel).await?;
        Ok(self.finish(batch))
    }

    /// Same work as [`run`](Self::run), one dataset after the other on the
    /// calling task, without the executor.
    pub async fn run_sequential(
        &self,
        load_first: bool,
        cancel: &CancellationToken,
    ) -> Result<CleanOutcome> {
        if load_first {
            DatasetLoader::new(self.ctx.clone()).load_all(cancel).await?;
        }

        let mut results = BTreeMap::new();
        for kind in DatasetKind::ALL {
            let name = kind.task_name().to_string();
            let started = Instant::now();
            let outcome = if cancel.is_cancelled() {
                Err(PipelineError::Cancelled)
            } else {
                let work = clean_dataset(
                    self.ctx.clone(),
                    self.rule(kind),
                    self.validator.clone(),
                    cancel.clone(),
                );
                AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(PipelineError::panicked(&name, panic_message(panic.as_ref())))
                    })
            };
            results.insert(name.clone(), TaskResult::from_outcome(name, outcome, started.elapsed()));
        }
        Ok(self.finish(BatchResult::new(results)))
    }

    fn finish(&self, batch: BatchResult) -> CleanOutcome {
        let policy = self.ctx.config.success_policy;
        let policy_met = batch.satisfies(policy);
        let success_count = batch.success_count();

        if policy_met {
            info!(
                succeeded = success_count,
                total = batch.len(),
                rows = batch.total_rows(),
                %policy,
                "Cleaning finished"
            );
        } else {
            warn!(
                succeeded = success_count,
                total = batch.len(),
                %policy,
                "Cleaning did not meet the success policy"
            );
        }

        CleanOutcome {
            quality: policy_met.then(|| self.quality_report()),
            batch,
            success_count,
            policy,
            policy_met,
        }
    }

    /// Cleans one dataset, loading its raw table first if it is not cached.
    pub async fn clean_one(&self, name: &str, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let kind =
            DatasetKind::from_name(name).ok_or_else(|| PipelineError::UnknownDataset(name.to_string()))?;
        let raw_key = kind.cache_key(Stage::Raw);
        if !self.ctx.cache.contains(raw_key) {
            DatasetLoader::new(self.ctx.clone()).load_one(raw_key).await?;
        }
        clean_dataset(
            self.ctx.clone(),
            self.rule(kind),
            self.validator.clone(),
            cancel.clone(),
        )
        .await
    }

    pub fn quality_report(&self) -> QualityReport {
        let datasets: BTreeMap<String, FullValidation> = DatasetKind::ALL
            .iter()
            .filter_map(|kind| {
                let key = kind.cache_key(Stage::Clean);
                let table = self.ctx.cache.get(key)?;
                Some((key.to_string(), self.validator.full_report(&table, key, *kind)))
            })
            .collect();

        for (key, validation) in &datasets {
            for issue in &validation.issues {
                warn!(dataset = %key, issue = %issue, "Quality check");
            }
        }

        let average_completeness = if datasets.is_empty() {
            0.0
        } else {
            let sum: f64 = datasets.values().map(|v| v.report.completeness_percent).sum();
            (sum / datasets.len() as f64 * 10.0).round() / 10.0
        };

        QualityReport {
            datasets_processed: datasets.len(),
            all_passed: datasets.values().all(|v| v.passed),
            datasets,
            average_completeness,
        }
    }

    /// Shape and completeness of each cleaned dataset currently cached.
    pub fn statistics(&self) -> BTreeMap<String, DatasetStatistics> {
        self.quality_report()
            .datasets
            .into_iter()
            .map(|(key, validation)| {
                let stats = DatasetStatistics {
                    rows: validation.report.row_count,
                    columns: validation.report.column_count,
                    completeness_percent: validation.report.completeness_percent,
                };
                (key, stats)
            })
            .collect()
    }
}

/// The blocking half keeps running if this future is dropped by a timeout
/// or cancellation, so it checks `cancel` before writing anything.
async fn clean_dataset(
    ctx: PipelineContext,
    rule: Arc<dyn CleaningRule>,
    validator: DataValidator,
    cancel: CancellationToken,
) -> Result<TaskOutcome> {
    let kind = rule.kind();
    let raw_key = kind.cache_key(Stage::Raw);
    let clean_key = kind.cache_key(Stage::Clean);
    let timer = ctx.metrics.timer(kind.task_name());

    let raw = ctx
        .cache
        .get(raw_key)
        .ok_or_else(|| PipelineError::task(kind.task_name(), format!("{raw_key} not available")))?;
    let raw_rows = raw.row_count();

    let output = ctx.config.paths.clean_path(kind);
    let backup_dir = ctx.config.paths.backup_dir.clone();
    let write_to = output.clone();

    let abandoned = cancel.child_token();
    let _abandon_on_drop = abandoned.clone().drop_guard();

    let (cleaned, report, backup) = tokio::task::spawn_blocking(move || -> Result<_> {
        let cleaned = rule.clean(&raw)?;
        let report = validator.quality_report(&cleaned.table, clean_key, Some(kind));
        if abandoned.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let backup = io::save_with_backup(&cleaned.table, &write_to, &backup_dir)?;
        Ok((cleaned, report, backup))
    })
    .await
    .map_err(|e| match e.try_into_panic() {
        Ok(panic) => PipelineError::panicked(kind.task_name(), panic_message(panic.as_ref())),
        Err(e) => PipelineError::Join(e),
    })??;

    let rows = cleaned.table.row_count();
    ctx.cache.put(clean_key, cleaned.table);
    timer.stop();

    info!(
        dataset = %kind,
        raw_rows,
        rows,
        completeness = report.completeness_percent,
        "Dataset cleaned"
    );

    let payload = json!({
        "dataset": kind.as_str(),
        "raw_rows": raw_rows,
        "clean_rows": rows,
        "removed": cleaned.counters,
        "quality": report,
        "output": output,
        "backup": backup,
    });
    Ok(TaskOutcome::new(rows as u64, payload))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{DataPaths, PipelineConfig};
    use crate::datasets::{SAMPLE_CLEAN, STATUS_CLEAN};
    use crate::rules::{Cleaned, StatusRules};
    use chrono::NaiveDate;
    use leadflow_common::{CommonError, Table};
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(dir: &TempDir, policy: SuccessPolicy) -> PipelineContext {
        let paths = DataPaths::under(dir.path());
        std::fs::create_dir_all(&paths.raw_dir).unwrap();
        let mut sample = String::from("Id,Precio_Solicitado,Tipo_Inmueble,Ciudad\n");
        for i in 1..=30 {
            sample.push_str(&format!("{i},{},casa,bogota\n", 1000 + i * 10));
        }
        std::fs::write(paths.raw_dir.join("muestra.csv"), sample).unwrap();
        std::fs::write(
            paths.raw_dir.join("estados.csv"),
            "Inmueble_ID,Estado,Fecha_Actualizacion\n1,activo,2024-01-01\n2,,2024-01-02\n",
        )
        .unwrap();
        PipelineContext::new(
            PipelineConfig::default()
                .with_paths(paths)
                .with_success_policy(policy),
        )
    }

    fn fixed_status_rules() -> Arc<dyn CleaningRule> {
        let now = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Arc::new(StatusRules::at(now))
    }

    /// Status rules that take longer than the task deadline.
    struct SlowStatusRules(Arc<dyn CleaningRule>);

    impl CleaningRule for SlowStatusRules {
        fn kind(&self) -> DatasetKind {
            DatasetKind::Status
        }

        fn clean(&self, raw: &Table) -> std::result::Result<Cleaned, CommonError> {
            std::thread::sleep(Duration::from_millis(1500));
            self.0.clean(raw)
        }
    }

    #[tokio::test]
    async fn test_run_cleans_both_datasets() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, SuccessPolicy::Lenient);
        let cleaner = ParallelCleaner::new(ctx.clone()).with_rule(fixed_status_rules());

        let outcome = cleaner.run(true, &CancellationToken::new()).await.unwrap();

        assert!(outcome.policy_met);
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.batch.names(), vec!["clean_sample", "clean_status"]);
        assert!(ctx.cache.contains(SAMPLE_CLEAN));
        assert!(ctx.cache.contains(STATUS_CLEAN));
        assert_eq!(ctx.cache.get(STATUS_CLEAN).unwrap().row_count(), 1);
        assert!(ctx.config.paths.clean_path(DatasetKind::Sample).exists());
        assert!(std::fs::read_dir(&ctx.config.paths.backup_dir).unwrap().count() >= 2);

        let quality = outcome.quality.unwrap();
        assert_eq!(quality.datasets_processed, 2);
        assert!(quality.average_completeness > 0.0);
        let sample = &quality.datasets[SAMPLE_CLEAN];
        assert!(sample.critical_columns["Precio_Solicitado"].exists);
        assert_eq!(sample.critical_columns["Precio_Solicitado"].null_count, 0);
        // The fixture listing has no Area, Piso or Garajes column.
        assert!(!sample.passed);
        assert!(!quality.all_passed);

        let payload = &outcome.batch.get("clean_status").unwrap().payload;
        assert_eq!(payload["raw_rows"], 2);
        assert_eq!(payload["removed"]["incomplete_rows_removed"], 1);
    }

    #[tokio::test]
    async fn test_missing_raw_fails_only_that_task() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, SuccessPolicy::Lenient);
        std::fs::remove_file(ctx.config.paths.raw_path(DatasetKind::Status)).unwrap();
        let cleaner = ParallelCleaner::new(ctx.clone());

        let outcome = cleaner.run(true, &CancellationToken::new()).await.unwrap();
        assert!(outcome.policy_met);
        assert_eq!(outcome.success_count, 1);
        let status = outcome.batch.get("clean_status").unwrap();
        assert!(!status.succeeded);
        assert!(status.error.as_deref().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn test_timed_out_clean_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, SuccessPolicy::Lenient);
        let ctx = PipelineContext::new(ctx.config.as_ref().clone().with_task_timeout(Some(1)));
        let cleaner = ParallelCleaner::new(ctx.clone())
            .with_rule(Arc::new(SlowStatusRules(fixed_status_rules())));

        let outcome = cleaner.run(true, &CancellationToken::new()).await.unwrap();
        let status = outcome.batch.get("clean_status").unwrap();
        assert!(!status.succeeded);
        assert!(status.error.as_deref().unwrap().contains("deadline"));
        assert!(outcome.batch.get("clean_sample").unwrap().succeeded);

        // Give the abandoned blocking clean time to finish.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!ctx.config.paths.clean_path(DatasetKind::Status).exists());
        assert!(!ctx.cache.contains(STATUS_CLEAN));
        assert!(ctx.config.paths.clean_path(DatasetKind::Sample).exists());
    }

    #[tokio::test]
    async fn test_strict_policy_not_met() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, SuccessPolicy::RequireAll);
        std::fs::remove_file(ctx.config.paths.raw_path(DatasetKind::Status)).unwrap();
        let cleaner = ParallelCleaner::new(ctx);

        let outcome = cleaner.run(true, &CancellationToken::new()).await.unwrap();
        assert!(!outcome.policy_met);
        assert!(outcome.quality.is_none());
    }

    #[tokio::test]
    async fn test_sequential_and_clean_one() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, SuccessPolicy::Lenient);
        let cleaner = ParallelCleaner::new(ctx.clone()).with_rule(fixed_status_rules());

        let cancel = CancellationToken::new();
        let single = cleaner.clean_one("status", &cancel).await.unwrap();
        assert_eq!(single.rows_processed, 1);

        let outcome = cleaner
            .run_sequential(true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.batch.get("clean_sample").unwrap().succeeded);
        assert!(outcome.batch.get("clean_status").unwrap().succeeded);

        let stats = cleaner.statistics();
        assert_eq!(stats[STATUS_CLEAN].rows, 1);
        assert_eq!(stats[SAMPLE_CLEAN].columns, 4);
        assert!(cleaner.clean_one("other", &cancel).await.is_err());
    }
}
