//! Query-result caching with TTL expiry and usage-ordered eviction.
//!
//! # Overview
//!
//! Process-local cache-aside store for read-query results. Entries carry a
//! TTL (explicit, or derived per table) and usage metadata; when the entry
//! bound is exceeded, eviction removes entries coldest-first, ordered by
//! `(access_count, last_accessed)` ascending. Writes are never cached, and
//! every entry is tagged with its fingerprint and table so mutations can
//! invalidate exactly what they touched.
//!
//! # Consistency model
//!
//! Cache-aside, process-local, eventual. There is no cross-process
//! invalidation; external writers that bypass the cached executor must
//! call [`QueryCache::invalidate_by_table`] themselves.

mod key;

pub use key::{cache_key, fingerprint};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::driver::{QueryKind, Rows};

/// Metadata kept per cached entry.
#[derive(Debug, Clone)]
struct EntryMeta {
    fingerprint: String,
    table: String,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    size_bytes: usize,
    valid: bool,
}

impl EntryMeta {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn should_evict(&self, now: Instant) -> bool {
        !self.valid || self.is_expired(now)
    }

    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

#[derive(Debug)]
struct CachedValue {
    rows: Arc<Rows>,
    meta: EntryMeta,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CachedValue>,
    memory_usage: usize,
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fell through.
    pub misses: u64,
    /// Ratio of hits to total lookups (0.0 with no traffic).
    pub hit_rate: f64,
    /// Entries currently stored.
    pub size: usize,
    /// Bytes of result payload currently stored.
    pub memory_usage: usize,
    /// Entries stored across the cache lifetime.
    pub total_cached: u64,
    /// Entries removed by invalidation calls.
    pub invalidations: u64,
}

/// Bounded TTL + usage-ordered query-result cache (C2).
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    config: Mutex<CacheConfig>,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    total_cached: AtomicU64,
    invalidations: AtomicU64,
}

impl QueryCache {
    /// Create a cache. The configuration is taken as given; call
    /// [`CacheConfig::validate`] first when it comes from outside.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        info!(
            max_entries = config.max_entries,
            max_result_size = config.max_result_size,
            "query cache initialized"
        );
        let enabled = config.enabled;
        Self {
            inner: Mutex::new(CacheInner::default()),
            config: Mutex::new(config),
            enabled: AtomicBool::new(enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            total_cached: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cache with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Store a result.
    ///
    /// No-op when the cache is disabled, the kind is a write, the table is
    /// a system table, or the result exceeds `max_result_size`. An explicit
    /// `ttl` overrides the per-table default.
    pub fn put(
        &self,
        fingerprint: &str,
        kind: QueryKind,
        table: &str,
        params: &[String],
        rows: Arc<Rows>,
        ttl: Option<Duration>,
    ) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if !should_cache(kind, table) {
            return;
        }

        let config = self.config.lock().clone();
        let size_bytes = rows.size_bytes();
        if size_bytes > config.max_result_size {
            debug!(
                size_bytes,
                max = config.max_result_size,
                "result too large to cache"
            );
            return;
        }

        let now = Instant::now();
        let ttl = ttl.unwrap_or_else(|| default_ttl(kind, table, &config));
        let meta = EntryMeta {
            fingerprint: fingerprint.to_string(),
            table: table.to_string(),
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            access_count: 1,
            size_bytes,
            valid: true,
        };

        let key = cache_key(fingerprint, params);
        let mut inner = self.inner.lock();
        if let Some(replaced) = inner.entries.insert(key, CachedValue { rows, meta }) {
            inner.memory_usage = inner.memory_usage.saturating_sub(replaced.meta.size_bytes);
        }
        inner.memory_usage += size_bytes;
        self.total_cached.fetch_add(1, Ordering::Relaxed);

        Self::evict_if_needed(&mut inner, config.max_entries);
    }

    /// Look up a result. Expired or invalidated entries are removed on the
    /// way and count as misses.
    #[must_use]
    pub fn get(&self, fingerprint: &str, params: &[String]) -> Option<Arc<Rows>> {
        if !self.enabled.load(Ordering::Relaxed) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let key = cache_key(fingerprint, params);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // Resolve the lookup fully before mutating the map; the outcome
        // owns its data so the entry borrow ends with this match.
        enum Lookup {
            Hit(Arc<Rows>),
            Expired,
            Miss,
        }
        let outcome = match inner.entries.get_mut(&key) {
            Some(value) if !value.meta.should_evict(now) => {
                value.meta.touch(now);
                Lookup::Hit(Arc::clone(&value.rows))
            },
            Some(_) => Lookup::Expired,
            None => Lookup::Miss,
        };

        match outcome {
            Lookup::Hit(rows) => {
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(rows)
            },
            Lookup::Expired => {
                if let Some(removed) = inner.entries.remove(&key) {
                    inner.memory_usage = inner.memory_usage.saturating_sub(removed.meta.size_bytes);
                }
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
            Lookup::Miss => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Remove every entry with the given fingerprint, regardless of
    /// parameters. Returns the number removed.
    pub fn invalidate_by_fingerprint(&self, fingerprint: &str) -> usize {
        self.invalidate_where(|meta| meta.fingerprint == fingerprint)
    }

    /// Remove every entry tagged with the given table. Returns the number
    /// removed.
    pub fn invalidate_by_table(&self, table: &str) -> usize {
        let removed = self.invalidate_where(|meta| meta.table == table);
        if removed > 0 {
            info!(table, removed, "invalidated cache entries for table");
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`. Returns the
    /// number removed.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some(value) = inner.entries.remove(&key) {
                inner.memory_usage = inner.memory_usage.saturating_sub(value.meta.size_bytes);
                removed += 1;
            }
        }
        drop(inner);
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop everything. Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let cleared = inner.entries.len();
        inner.entries.clear();
        inner.memory_usage = 0;
        drop(inner);
        self.invalidations.fetch_add(cleared as u64, Ordering::Relaxed);
        info!(cleared, "query cache cleared");
        cleared
    }

    /// Eagerly remove expired and invalidated entries. Returns the number
    /// removed. Driven periodically by the cached executor.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, v)| v.meta.should_evict(now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some(value) = inner.entries.remove(&key) {
                inner.memory_usage = inner.memory_usage.saturating_sub(value.meta.size_bytes);
                removed += 1;
            }
        }
        drop(inner);
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Enable or disable caching at runtime. A disabled cache misses on
    /// every read and drops every write; stored entries are kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "query caching toggled");
    }

    /// Replace the configuration; evicts immediately if the new entry
    /// bound is tighter.
    pub fn update_config(&self, config: CacheConfig) {
        let max_entries = config.max_entries;
        self.enabled.store(config.enabled, Ordering::Relaxed);
        *self.config.lock() = config;
        let mut inner = self.inner.lock();
        Self::evict_if_needed(&mut inner, max_entries);
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size: inner.entries.len(),
            memory_usage: inner.memory_usage,
            total_cached: self.total_cached.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Whether the cache is pulling its weight: hit rate at or above the
    /// configured threshold once there is enough traffic to judge, and
    /// memory within bounds. A cold cache reports healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let stats = self.stats();
        let config = self.config.lock().clone();
        let warmed = stats.hits + stats.misses >= 100;
        let rate_ok = !warmed || stats.hit_rate >= config.hit_rate_threshold;
        let memory_ok = stats.memory_usage <= config.max_result_size.saturating_mul(config.max_entries);
        rate_ok && memory_ok
    }

    fn invalidate_where(&self, predicate: impl Fn(&EntryMeta) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, v)| predicate(&v.meta))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some(value) = inner.entries.remove(&key) {
                inner.memory_usage = inner.memory_usage.saturating_sub(value.meta.size_bytes);
                removed += 1;
            }
        }
        drop(inner);
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Evict coldest entries, ordered by `(access_count, last_accessed)`
    /// ascending, until the entry count is within `max_entries`.
    fn evict_if_needed(inner: &mut CacheInner, max_entries: usize) {
        if inner.entries.len() <= max_entries {
            return;
        }

        let mut ranked: Vec<(String, u64, Instant)> = inner
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.meta.access_count, v.meta.last_accessed))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let to_remove = inner.entries.len() - max_entries;
        for (key, _, _) in ranked.into_iter().take(to_remove) {
            if let Some(value) = inner.entries.remove(&key) {
                inner.memory_usage = inner.memory_usage.saturating_sub(value.meta.size_bytes);
            }
        }
        debug!(evicted = to_remove, "evicted cache entries to maintain size limit");
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("QueryCache")
            .field("size", &stats.size)
            .field("hit_rate", &stats.hit_rate)
            .finish_non_exhaustive()
    }
}

/// Write kinds and system tables are never cached.
fn should_cache(kind: QueryKind, table: &str) -> bool {
    if kind.is_write() {
        return false;
    }
    !(table.starts_with("pg_") || table.starts_with("information_schema"))
}

/// Per-table TTL: user-facing tables change frequently, social content
/// even more so, everything else gets the configured default.
fn default_ttl(kind: QueryKind, table: &str, config: &CacheConfig) -> Duration {
    if kind == QueryKind::Select {
        match table {
            "users" | "profiles" => Duration::from_secs(15 * 60),
            "notes" | "comments" => Duration::from_secs(5 * 60),
            _ => config.default_ttl(),
        }
    } else {
        config.default_ttl()
    }
}
