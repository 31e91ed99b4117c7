//! Configuration management

use crate::datasets::{DatasetKind, DatasetSource, Stage};
use crate::executor::{SuccessPolicy, DEFAULT_MAX_WORKERS};
use crate::pool::{
    PoolSettings, DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_MAX_LIFETIME_SECS, DEFAULT_MAX_OVERFLOW,
    DEFAULT_MIN_CONNECTIONS, DEFAULT_POOL_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Path Constants
// ============================================================================

/// Default directory holding the raw input CSVs.
pub const DEFAULT_RAW_DIR: &str = "./data/processedData";

/// Default directory for cleaned outputs.
pub const DEFAULT_CLEAN_DIR: &str = "./data/cleanData";

/// Default directory for timestamped backups.
pub const DEFAULT_BACKUP_DIR: &str = "./dataBackup";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Target database; the SQL phase is skipped when unset
    pub database_url: Option<String>,
    pub paths: DataPaths,
    pub max_workers: usize,
    pub task_timeout_secs: Option<u64>,
    pub success_policy: SuccessPolicy,
    pub pool: PoolSettings,
}

/// Where datasets are read from and written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPaths {
    pub raw_dir: PathBuf,
    pub clean_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl DataPaths {
    /// All three directories under one root, as `raw/`, `clean/` and `backup/`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            raw_dir: root.join("raw"),
            clean_dir: root.join("clean"),
            backup_dir: root.join("backup"),
        }
    }

    pub fn raw_path(&self, kind: DatasetKind) -> PathBuf {
        self.raw_dir.join(kind.raw_file())
    }

    pub fn clean_path(&self, kind: DatasetKind) -> PathBuf {
        self.clean_dir.join(kind.clean_file())
    }
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from(DEFAULT_RAW_DIR),
            clean_dir: PathBuf::from(DEFAULT_CLEAN_DIR),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from the process environment only
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = PoolSettings::default();

        let success_policy = match std::env::var("LEADFLOW_SUCCESS_POLICY") {
            Ok(raw) => SuccessPolicy::from_str(&raw)?,
            Err(_) => SuccessPolicy::default(),
        };

        let config = PipelineConfig {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            paths: DataPaths {
                raw_dir: env_path("LEADFLOW_RAW_DIR", DEFAULT_RAW_DIR),
                clean_dir: env_path("LEADFLOW_CLEAN_DIR", DEFAULT_CLEAN_DIR),
                backup_dir: env_path("LEADFLOW_BACKUP_DIR", DEFAULT_BACKUP_DIR),
            },
            max_workers: env_parse("LEADFLOW_MAX_WORKERS").unwrap_or(DEFAULT_MAX_WORKERS),
            task_timeout_secs: env_parse("LEADFLOW_TASK_TIMEOUT_SECS").filter(|s| *s > 0),
            success_policy,
            pool: PoolSettings {
                min_size: env_parse("DB_MIN_CONNECTIONS").unwrap_or(DEFAULT_MIN_CONNECTIONS),
                size: env_parse("DB_POOL_SIZE").unwrap_or(DEFAULT_POOL_SIZE),
                max_overflow: env_parse("DB_MAX_OVERFLOW").unwrap_or(DEFAULT_MAX_OVERFLOW),
                acquire_timeout_secs: env_parse("DB_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
                max_lifetime_secs: Some(
                    env_parse("DB_MAX_LIFETIME_SECS").unwrap_or(DEFAULT_MAX_LIFETIME_SECS),
                ),
                ..defaults
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be greater than 0");
        }

        if self.pool.size == 0 {
            anyhow::bail!("Database pool size must be greater than 0");
        }

        if self.pool.min_size > self.pool.max_connections() {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.pool.min_size,
                self.pool.max_connections()
            );
        }

        if let Some(url) = &self.database_url {
            if !url.contains(':') {
                anyhow::bail!("DATABASE_URL is not a connection string");
            }
        }

        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn without_database(mut self) -> Self {
        self.database_url = None;
        self
    }

    pub fn with_paths(mut self, paths: DataPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_task_timeout(mut self, secs: Option<u64>) -> Self {
        self.task_timeout_secs = secs;
        self
    }

    pub fn with_success_policy(mut self, policy: SuccessPolicy) -> Self {
        self.success_policy = policy;
        self
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// Raw inputs first, then the cleaned outputs.
    pub fn sources(&self) -> Vec<DatasetSource> {
        let raw = DatasetKind::ALL
            .iter()
            .map(|kind| DatasetSource::new(*kind, Stage::Raw, self.paths.raw_path(*kind)));
        let clean = DatasetKind::ALL
            .iter()
            .map(|kind| DatasetSource::new(*kind, Stage::Clean, self.paths.clean_path(*kind)));
        raw.chain(clean).collect()
    }

    pub fn source(&self, key: &str) -> Option<DatasetSource> {
        self.sources().into_iter().find(|s| s.key == key)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            paths: DataPaths::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            task_timeout_secs: None,
            success_policy: SuccessPolicy::default(),
            pool: PoolSettings::default(),
        }
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "LEADFLOW_RAW_DIR",
        "LEADFLOW_CLEAN_DIR",
        "LEADFLOW_BACKUP_DIR",
        "LEADFLOW_MAX_WORKERS",
        "LEADFLOW_TASK_TIMEOUT_SECS",
        "LEADFLOW_SUCCESS_POLICY",
        "DB_POOL_SIZE",
        "DB_MAX_OVERFLOW",
        "DB_MIN_CONNECTIONS",
        "DB_ACQUIRE_TIMEOUT_SECS",
        "DB_MAX_LIFETIME_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_from_empty_env() {
        clear_env();
        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.database_url, None);
        assert_eq!(config.paths, DataPaths::default());
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.success_policy, SuccessPolicy::Lenient);
        assert_eq!(config.pool.size, 10);
        assert_eq!(config.pool.max_overflow, 20);
        assert_eq!(config.pool.max_lifetime_secs, Some(3600));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        std::env::set_var("LEADFLOW_RAW_DIR", "/tmp/raw");
        std::env::set_var("LEADFLOW_MAX_WORKERS", "4");
        std::env::set_var("LEADFLOW_TASK_TIMEOUT_SECS", "90");
        std::env::set_var("LEADFLOW_SUCCESS_POLICY", "require_all");
        std::env::set_var("DB_POOL_SIZE", "3");

        let config = PipelineConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.paths.raw_dir, PathBuf::from("/tmp/raw"));
        assert_eq!(config.paths.clean_dir, PathBuf::from(DEFAULT_CLEAN_DIR));
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.success_policy, SuccessPolicy::RequireAll);
        assert_eq!(config.pool.size, 3);
    }

    #[test]
    #[serial]
    fn test_rejects_bad_values() {
        clear_env();
        std::env::set_var("LEADFLOW_SUCCESS_POLICY", "sometimes");
        assert!(PipelineConfig::from_env().is_err());
        clear_env();

        std::env::set_var("LEADFLOW_MAX_WORKERS", "0");
        assert!(PipelineConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_sources_cover_raw_and_clean() {
        let config = PipelineConfig::default().with_paths(DataPaths::under("/data"));
        let keys: Vec<String> = config.sources().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["sample_raw", "status_raw", "sample_clean", "status_clean"]);

        let clean = config.source("status_clean").unwrap();
        assert_eq!(clean.path, PathBuf::from("/data/clean/CLESTADOS.csv"));
        assert!(config.source("other").is_none());
    }
}
