//! Cached dataset loading
//!
//! Every load goes through [`DatasetCache::get_or_load`], so a dataset is read
//! from disk once per run no matter how many phases ask for it. Reads happen on
//! the blocking pool.

use crate::cache::{CacheStats, DatasetCache};
use crate::context::PipelineContext;
use crate::datasets::DatasetSource;
use crate::error::{PipelineError, Result};
use crate::validation::DataValidator;
use leadflow_common::{io, Table};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reads a table from disk. Called from a blocking thread.
pub trait TableReader: Send + Sync + 'static {
    fn read(&self, path: &Path) -> leadflow_common::Result<Table>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvTableReader;

impl TableReader for CsvTableReader {
    fn read(&self, path: &Path) -> leadflow_common::Result<Table> {
        io::read_csv(path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub path: PathBuf,
    pub exists: bool,
    pub cached: bool,
}

pub struct DatasetLoader {
    ctx: PipelineContext,
    reader: Arc<dyn TableReader>,
    validator: DataValidator,
}

impl DatasetLoader {
    pub fn new(ctx: PipelineContext) -> Self {
        Self::with_reader(ctx, Arc::new(CsvTableReader))
    }

    pub fn with_reader(ctx: PipelineContext, reader: Arc<dyn TableReader>) -> Self {
        Self {
            ctx,
            reader,
            validator: DataValidator::default(),
        }
    }

    fn cache(&self) -> &DatasetCache {
        &self.ctx.cache
    }

    /// Loads every configured dataset whose file exists.
    ///
    /// Missing files and unreadable datasets are logged and left out of the
    /// result. Cancellation is checked before each dataset.
    pub async fn load_all(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, Arc<Table>>> {
        let mut loaded = BTreeMap::new();

        for source in self.ctx.config.sources() {
            if cancel.is_cancelled() {
                warn!(loaded = loaded.len(), "Dataset loading cancelled");
                return Err(PipelineError::Cancelled);
            }

            match self.load_source(&source).await {
                Ok(table) => {
                    loaded.insert(source.key.clone(), table);
                },
                Err(PipelineError::MissingInput { key, path }) => {
                    warn!(key = %key, path = %path.display(), "Dataset file not found, skipping");
                },
                Err(e) => {
                    error!(key = %source.key, error = %e, "Failed to load dataset");
                },
            }
        }

        info!(
            loaded = loaded.len(),
            keys = ?loaded.keys().collect::<Vec<_>>(),
            "Datasets loaded"
        );
        Ok(loaded)
    }

    /// Loads a single dataset by cache key.
    pub async fn load_one(&self, key: &str) -> Result<Arc<Table>> {
        let source = self
            .ctx
            .config
            .source(key)
            .ok_or_else(|| PipelineError::UnknownDataset(key.to_string()))?;
        self.load_source(&source).await
    }

    async fn load_source(&self, source: &DatasetSource) -> Result<Arc<Table>> {
        if !source.path.exists() {
            return Err(PipelineError::MissingInput {
                key: source.key.clone(),
                path: source.path.clone(),
            });
        }

        let timer = self.ctx.metrics.timer(format!("load_{}", source.key));
        let table = self
            .cache()
            .get_or_load(&source.key, || {
                let reader = Arc::clone(&self.reader);
                let path = source.path.clone();
                let key = source.key.clone();
                async move {
                    debug!(key = %key, path = %path.display(), "Reading dataset");
                    tokio::task::spawn_blocking(move || reader.read(&path))
                        .await?
                        .map_err(|source| PipelineError::LoadFailure { key, source })
                }
            })
            .await?;
        timer.stop();

        if source.is_raw() {
            let issues = self.validator.validate_structure(&table, Some(source.kind));
            for issue in &issues {
                warn!(key = %source.key, issue = %issue, "Structural issue in raw dataset");
            }
        }

        Ok(table)
    }

    /// Cached table for `key`, without touching disk.
    pub fn dataset(&self, key: &str) -> Option<Arc<Table>> {
        self.cache().get(key)
    }

    pub fn availability(&self) -> BTreeMap<String, Availability> {
        self.ctx
            .config
            .sources()
            .into_iter()
            .map(|source| {
                let entry = Availability {
                    exists: source.path.exists(),
                    cached: self.cache().contains(&source.key),
                    path: source.path,
                };
                (source.key, entry)
            })
            .collect()
    }

    /// Drops the given keys from the cache, or everything when `keys` is empty.
    /// Returns how many entries were removed.
    pub fn clear_cache(&self, keys: &[&str]) -> usize {
        let removed = if keys.is_empty() {
            self.cache().clear()
        } else {
            keys.iter().filter(|key| self.cache().invalidate(key)).count()
        };
        info!(removed, "Cache cleared");
        removed
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }
}
