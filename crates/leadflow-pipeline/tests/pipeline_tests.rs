//! End-to-end pipeline runs against temporary data directories and SQLite

mod common;

use common::{init_tracing, LeadFixture};
use leadflow_pipeline::datasets::{SAMPLE_CLEAN, STATUS_CLEAN};
use leadflow_pipeline::orchestrator::DatabaseStatus;
use leadflow_pipeline::rules::Cleaned;
use leadflow_pipeline::{
    CleaningRule, DatasetKind, IndicatorsCalculator, Orchestrator, ParallelCleaner,
    PipelineConfig, PipelineContext, PipelineState, SampleRules, SqlExecutor, SqlPhase,
    SuccessPolicy,
};
use leadflow_common::{io, CommonError, Table, Value};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Listing rules that panic the first time they run.
#[derive(Default)]
struct PanicOnceRules {
    inner: SampleRules,
    tripped: AtomicBool,
}

impl CleaningRule for PanicOnceRules {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Sample
    }

    fn clean(&self, raw: &Table) -> Result<Cleaned, CommonError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("price column index out of range");
        }
        self.inner.clean(raw)
    }
}

#[tokio::test]
async fn test_full_run_without_database() -> anyhow::Result<()> {
    init_tracing();
    let data = LeadFixture::new().write();
    let ctx = data.context();
    let orchestrator = Orchestrator::new(ctx.clone());

    let report = orchestrator.run(&CancellationToken::new()).await;

    assert!(report.success, "run failed: {:?}", report.error);
    assert_eq!(report.state, PipelineState::Done);
    assert!(!report.fallback_used);
    assert!(matches!(report.sql, Some(SqlPhase::Skipped { .. })));
    assert_eq!(report.phases_completed, vec!["data_load", "clean"]);
    assert_eq!(report.datasets_loaded, vec!["sample_raw", "status_raw"]);

    let sample = ctx.cache.get(SAMPLE_CLEAN).expect("sample cleaned");
    let status = ctx.cache.get(STATUS_CLEAN).expect("status cleaned");
    assert!(sample.row_count() + status.row_count() <= 150);
    assert!(sample.row_count() > 0 && status.row_count() > 0);

    // Cleaned files on disk match the cache.
    let written = io::read_csv(data.paths.clean_path(DatasetKind::Sample))?;
    assert_eq!(written.row_count(), sample.row_count());
    assert!(data.paths.clean_path(DatasetKind::Status).exists());

    let cleaning = report.cleaning.expect("cleaning outcome");
    assert_eq!(cleaning.success_count, 2);
    assert!(cleaning.quality.is_some());

    let metrics = ctx.metrics.metrics();
    for op in ["data_load", "parallel_clean", "clean_sample", "clean_status"] {
        assert!(metrics.contains_key(op), "missing metric {op}");
    }
    assert!(ctx.metrics.in_flight().is_empty());
    assert!(report.performance.operations_count >= 4);
    Ok(())
}

#[tokio::test]
async fn test_full_run_loads_sqlite() -> anyhow::Result<()> {
    init_tracing();
    let data = LeadFixture::new().write();
    let ctx = PipelineContext::new(data.config().with_database_url(data.sqlite_dsn()));
    let orchestrator = Orchestrator::new(ctx.clone());
    let cancel = CancellationToken::new();

    let report = orchestrator.run(&cancel).await;
    assert!(report.success);
    assert_eq!(report.state, PipelineState::Done);
    let Some(SqlPhase::Loaded(sql_report)) = &report.sql else {
        panic!("expected SQL load, got {:?}", report.sql);
    };
    assert_eq!(sql_report.tables_loaded, 2);
    assert!(report.phases_completed.contains(&"sql_load".to_string()));
    assert!(report.optimizations.contains(&"connection_pooling".to_string()));

    let sql = SqlExecutor::from_context(&ctx).expect("database configured");
    let counted = sql
        .run_query("SELECT COUNT(*) AS n FROM sample", "count_sample", &cancel)
        .await
        .expect("query result");
    let expected = ctx.cache.get(SAMPLE_CLEAN).expect("cached").row_count() as f64;
    assert_eq!(counted.cell(0, "n"), Some(&Value::Number(expected)));

    let mut tables = sql.list_tables(&cancel).await?;
    tables.sort();
    assert_eq!(tables, vec!["sample", "status"]);
    Ok(())
}

#[tokio::test]
async fn test_indicators_after_run() -> anyhow::Result<()> {
    init_tracing();
    let data = LeadFixture::new().write();
    let ctx = data.context();
    let report = Orchestrator::new(ctx.clone()).run(&CancellationToken::new()).await;
    assert!(report.success);

    let indicators = IndicatorsCalculator::new(ctx.clone()).calculate().await?;
    let listings = indicators.listings.expect("listing indicators");
    let sample_rows = ctx.cache.get(SAMPLE_CLEAN).expect("cached").row_count();
    assert_eq!(listings.reliability.total_records, sample_rows);
    assert_eq!(listings.reliability.complete_records, sample_rows);
    assert!(listings.average_price_per_m2.is_some_and(|p| p > 0.0));
    assert_eq!(listings.outliers.analyzed, sample_rows);

    // 50 raw rows less five empty statuses and one future date.
    let funnel = indicators.funnel.expect("funnel indicators");
    assert_eq!(funnel.discards.total_properties, 44);
    assert_eq!(funnel.discards.discarded, 0);
    assert_eq!(funnel.review_address.properties, 0);
    let initial = funnel.initial_state.expect("initial state");
    assert_eq!(initial.state, "Activo");
    assert_eq!(initial.properties, 29);

    // Same numbers from the files alone.
    let from_disk = IndicatorsCalculator::new(data.context()).calculate().await?;
    assert_eq!(from_disk.funnel.expect("funnel").discards.total_properties, 44);
    Ok(())
}

#[tokio::test]
async fn test_no_datasets_is_a_structured_failure() {
    init_tracing();
    let data = LeadFixture::new().without_sample().without_status().write();
    let orchestrator = Orchestrator::new(data.context());

    let report = orchestrator.run(&CancellationToken::new()).await;

    assert!(!report.success);
    assert_eq!(report.state, PipelineState::Failed);
    assert!(!report.fallback_used);
    assert!(report.error.as_deref().unwrap_or_default().contains("No datasets"));
    assert_eq!(orchestrator.state(), PipelineState::Failed);
}

#[tokio::test]
async fn test_lenient_policy_accepts_one_dataset() {
    init_tracing();
    let data = LeadFixture::new().without_status().write();
    let report = Orchestrator::new(data.context())
        .run(&CancellationToken::new())
        .await;

    assert!(report.success);
    let cleaning = report.cleaning.expect("cleaning outcome");
    assert_eq!(cleaning.success_count, 1);
    assert!(!cleaning.batch.get("clean_status").expect("status task").succeeded);
}

#[tokio::test]
async fn test_strict_policy_failure_is_not_retried() {
    init_tracing();
    let data = LeadFixture::new().without_status().write();
    let ctx = PipelineContext::new(data.config().with_success_policy(SuccessPolicy::RequireAll));
    let report = Orchestrator::new(ctx).run(&CancellationToken::new()).await;

    assert!(!report.success);
    assert_eq!(report.state, PipelineState::Failed);
    assert!(!report.fallback_used);
    assert!(report.cleaning.is_some());
    assert!(report.error.as_deref().unwrap_or_default().contains("require_all"));
}

#[tokio::test]
async fn test_panicking_clean_falls_back_to_sequential() {
    init_tracing();
    let data = LeadFixture::new().write();
    let ctx = PipelineContext::new(data.config().with_success_policy(SuccessPolicy::RequireAll));
    let cleaner = ParallelCleaner::new(ctx.clone()).with_rule(Arc::new(PanicOnceRules::default()));
    let orchestrator = Orchestrator::with_cleaner(ctx.clone(), cleaner);

    let report = orchestrator.run(&CancellationToken::new()).await;

    assert!(report.success, "fallback run failed: {:?}", report.error);
    assert_eq!(report.state, PipelineState::Done);
    assert!(report.fallback_used);
    let original = report.original_error.as_deref().expect("original error kept");
    assert!(original.contains("parallel_clean"), "unexpected original error: {original}");
    assert!(report.error.is_none());
    assert!(report.optimizations.contains(&"sequential_fallback".to_string()));

    let cleaning = report.cleaning.expect("cleaning outcome");
    assert_eq!(cleaning.success_count, 2);
    assert!(ctx.cache.contains(SAMPLE_CLEAN));
    assert!(data.paths.clean_path(DatasetKind::Sample).exists());
    assert!(ctx.metrics.metrics().contains_key("sequential_clean"));
}

#[tokio::test]
async fn test_unreachable_database_degrades() {
    init_tracing();
    let data = LeadFixture::new().write();
    let missing = data.dir.path().join("missing").join("leads.db");
    let ctx = PipelineContext::new(
        data.config()
            .with_database_url(format!("sqlite://{}", missing.display())),
    );

    let report = Orchestrator::new(ctx).run(&CancellationToken::new()).await;

    assert!(report.success);
    assert_eq!(report.state, PipelineState::Degraded);
    assert!(matches!(report.sql, Some(SqlPhase::Degraded { .. })));
}

#[tokio::test]
async fn test_cancelled_run_fails_cleanly() {
    init_tracing();
    let data = LeadFixture::new().write();
    let ctx = data.context();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = Orchestrator::new(ctx.clone()).run(&cancel).await;
    assert!(!report.success);
    assert!(!report.fallback_used);
    assert!(ctx.metrics.in_flight().is_empty());
}

#[tokio::test]
async fn test_status_and_reset() {
    init_tracing();
    let data = LeadFixture::new().write();
    let orchestrator = Orchestrator::new(data.context());
    let cancel = CancellationToken::new();

    let before = orchestrator.status(&cancel).await;
    assert!(matches!(before.database, DatabaseStatus::NotConfigured));
    assert!(before.datasets["sample_raw"].exists);
    assert_eq!(before.health.components_ok, 2);
    assert!(!before.health.healthy);

    orchestrator.run(&cancel).await;
    let after = orchestrator.status(&cancel).await;
    assert_eq!(after.state, PipelineState::Done);
    assert_eq!(after.health.components_ok, 3);
    assert!(after.health.healthy);
    assert_eq!(after.cleaning.len(), 2);

    assert!(orchestrator.reset() >= 4);
    assert_eq!(orchestrator.state(), PipelineState::Idle);
    assert!(orchestrator.context().cache.is_empty());
}

#[tokio::test]
#[serial]
async fn test_config_from_environment() -> anyhow::Result<()> {
    init_tracing();
    let data = LeadFixture::new().sample_rows(40).status_rows(20).write();
    std::env::remove_var("DATABASE_URL");
    std::env::set_var("LEADFLOW_RAW_DIR", &data.paths.raw_dir);
    std::env::set_var("LEADFLOW_CLEAN_DIR", &data.paths.clean_dir);
    std::env::set_var("LEADFLOW_BACKUP_DIR", &data.paths.backup_dir);
    std::env::set_var("LEADFLOW_MAX_WORKERS", "1");

    let config = PipelineConfig::from_env();
    for var in [
        "LEADFLOW_RAW_DIR",
        "LEADFLOW_CLEAN_DIR",
        "LEADFLOW_BACKUP_DIR",
        "LEADFLOW_MAX_WORKERS",
    ] {
        std::env::remove_var(var);
    }
    let config = config?;
    assert_eq!(config.max_workers, 1);

    let report = Orchestrator::new(PipelineContext::new(config))
        .run(&CancellationToken::new())
        .await;
    assert!(report.success);
    assert!(report
        .optimizations
        .contains(&"parallel_cleaning (1 workers)".to_string()));
    Ok(())
}
