//! In-memory dataset cache with single-flight loading
//!
//! Entries are `Arc<Table>` handed out without copying. A miss in
//! [`DatasetCache::get_or_load`] takes a per-key async guard, checks again,
//! and only then runs the loader, so concurrent callers for the same key
//! share one load. If that load fails nothing is stored; each waiter then
//! runs its own loader in turn.
//!
//! There is no eviction: the cache holds the handful of batch datasets of
//! one pipeline run.

use chrono::{DateTime, Utc};
use leadflow_common::Table;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct CacheEntry {
    table: Arc<Table>,
    loaded_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub rows: usize,
    pub columns: usize,
    pub approx_bytes: usize,
    pub loaded_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Loader invocations, successful or not
    pub loads: u64,
    pub load_failures: u64,
    pub approx_bytes: usize,
    pub keys: Vec<EntryInfo>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
pub struct DatasetCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    load_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &str) -> Option<Arc<Table>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        entry.last_access = Utc::now();
        Some(Arc::clone(&entry.table))
    }

    /// Returns the cached table, if any.
    pub fn get(&self, key: &str) -> Option<Arc<Table>> {
        let found = self.lookup(key);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Returns the cached table or loads it, running at most one loader per
    /// key at a time.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> Result<Arc<Table>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Table, E>>,
    {
        if let Some(table) = self.get(key) {
            return Ok(table);
        }

        let guard = self.load_guard(key);
        let result = {
            let _loading = guard.lock().await;
            self.load_locked(key, loader).await
        };
        drop(guard);
        self.prune_guards();
        result
    }

    async fn load_locked<F, Fut, E>(&self, key: &str, loader: F) -> Result<Arc<Table>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Table, E>>,
    {
        // Another caller may have finished the load while we waited.
        if let Some(table) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache filled by concurrent load");
            return Ok(table);
        }

        self.loads.fetch_add(1, Ordering::Relaxed);
        match loader().await {
            Ok(table) => {
                let table = Arc::new(table);
                self.insert(key, Arc::clone(&table));
                info!(key, rows = table.row_count(), "Dataset cached");
                Ok(table)
            },
            Err(err) => {
                self.load_failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            },
        }
    }

    fn guards(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.load_guards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_guard(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.guards().entry(key.to_string()).or_default())
    }

    /// Drops guards no caller holds. Handing out a guard takes the same lock,
    /// so a count of one cannot race with a new waiter.
    fn prune_guards(&self) {
        self.guards().retain(|_, guard| Arc::strong_count(guard) > 1);
    }

    fn insert(&self, key: &str, table: Arc<Table>) {
        let now = Utc::now();
        self.entries().insert(
            key.to_string(),
            CacheEntry {
                table,
                loaded_at: now,
                last_access: now,
            },
        );
    }

    /// Stores `table` under `key`, replacing any previous entry.
    pub fn put(&self, key: &str, table: impl Into<Arc<Table>>) -> Arc<Table> {
        let table = table.into();
        self.insert(key, Arc::clone(&table));
        debug!(key, rows = table.row_count(), "Dataset stored");
        table
    }

    /// Removes one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries().remove(key).is_some();
        self.prune_guards();
        if removed {
            debug!(key, "Cache entry invalidated");
        }
        removed
    }

    /// Removes every entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        drop(entries);
        self.prune_guards();
        info!(entries = count, "Cache cleared");
        count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Approximate bytes held per key.
    pub fn memory_usage(&self) -> HashMap<String, usize> {
        self.entries()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.table.approx_bytes()))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries();
        let mut keys: Vec<EntryInfo> = entries
            .iter()
            .map(|(key, entry)| EntryInfo {
                key: key.clone(),
                rows: entry.table.row_count(),
                columns: entry.table.column_count(),
                approx_bytes: entry.table.approx_bytes(),
                loaded_at: entry.loaded_at,
                last_access: entry.last_access,
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        CacheStats {
            entries: entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            approx_bytes: keys.iter().map(|k| k.approx_bytes).sum(),
            keys,
        }
    }
}
