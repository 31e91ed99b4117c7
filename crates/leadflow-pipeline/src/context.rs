//! Shared state for one pipeline run

use crate::cache::DatasetCache;
use crate::config::PipelineConfig;
use crate::executor::TaskExecutor;
use crate::metrics::MetricsCollector;
use crate::pool::ConnectionPoolManager;
use std::sync::Arc;

/// Owns the cache, pool manager and metrics for a run. Cloning is cheap and
/// every clone sees the same state.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub cache: Arc<DatasetCache>,
    pub pools: Arc<ConnectionPoolManager>,
    pub metrics: Arc<MetricsCollector>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Self {
        let pools = ConnectionPoolManager::new(config.pool.clone());
        Self {
            config: Arc::new(config),
            cache: Arc::new(DatasetCache::new()),
            pools: Arc::new(pools),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor::new(self.config.max_workers).with_task_timeout(self.config.task_timeout())
    }

    pub fn database_url(&self) -> Option<&str> {
        self.config.database_url.as_deref()
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("cached", &self.cache.keys())
            .field("engines", &self.pools.engine_count())
            .finish_non_exhaustive()
    }
}
