//! Cache-aware query execution (C6).
//!
//! Repositories call [`CachedExecutor::execute`] and get caching, load
//! balancing, pooling and monitoring in one step:
//!
//! 1. fingerprint the statement text
//! 2. read-like kinds consult the cache and return a shared result on hit
//! 3. otherwise pick a pool, lease a connection, and time the execution
//! 4. read-like results within size limits are cached
//! 5. writes invalidate the affected table
//!
//! Cache failures never fail the query: the executor logs and degrades to
//! the uncached path.

use std::sync::Arc;
use std::time::Duration;

use murmur_error::StoreError;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::balancer::LoadBalancer;
use crate::cache::{fingerprint, CacheStats, QueryCache};
use crate::driver::{QueryKind, Rows};
use crate::monitor::PerformanceMonitor;
use crate::pool::ConnectionPool;

/// Single entry point for repository query execution.
pub struct CachedExecutor {
    cache: Arc<QueryCache>,
    balancer: Arc<LoadBalancer>,
    pools: Vec<Arc<ConnectionPool>>,
    monitor: Arc<PerformanceMonitor>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CachedExecutor {
    /// Build an executor over one or more pools.
    ///
    /// The balancer must have been constructed with `pools.len()` slots; a
    /// selection outside the pool list falls back to pool 0.
    ///
    /// # Panics
    ///
    /// Panics if `pools` is empty.
    #[must_use]
    pub fn new(
        cache: Arc<QueryCache>,
        balancer: Arc<LoadBalancer>,
        pools: Vec<Arc<ConnectionPool>>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        assert!(!pools.is_empty(), "executor needs at least one pool");
        Self {
            cache,
            balancer,
            pools,
            monitor,
            sweeper: Mutex::new(None),
        }
    }

    /// Convenience constructor for the single-pool deployment.
    #[must_use]
    pub fn single(
        cache: Arc<QueryCache>,
        pool: Arc<ConnectionPool>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let balancer = Arc::new(LoadBalancer::new(1, crate::balancer::BalancingStrategy::RoundRobin));
        Self::new(cache, balancer, vec![pool], monitor)
    }

    /// Execute a statement with caching.
    ///
    /// # Errors
    ///
    /// Propagates pool acquisition and driver errors. Cache trouble is
    /// logged, never surfaced.
    pub async fn execute(
        &self,
        query: &str,
        params: &[String],
        kind: QueryKind,
        table: &str,
    ) -> Result<Arc<Rows>, StoreError> {
        let fp = fingerprint(query);

        if kind.is_read_like() {
            if let Some(hit) = self.cache.get(&fp, params) {
                debug!(fingerprint = %fp, table, "cache hit");
                return Ok(hit);
            }
        }

        let rows = self.run(&fp, query, params, kind, table).await?;

        if kind.is_read_like() {
            self.cache.put(&fp, kind, table, params, Arc::clone(&rows), None);
        }
        if kind.is_write() {
            self.cache.invalidate_by_table(table);
        }

        Ok(rows)
    }

    /// Execute a statement, bypassing the cache entirely (no lookup, no
    /// store, no invalidation).
    pub async fn execute_uncached(
        &self,
        query: &str,
        params: &[String],
        kind: QueryKind,
        table: &str,
    ) -> Result<Arc<Rows>, StoreError> {
        let fp = fingerprint(query);
        self.run(&fp, query, params, kind, table).await
    }

    async fn run(
        &self,
        fp: &str,
        query: &str,
        params: &[String],
        kind: QueryKind,
        table: &str,
    ) -> Result<Arc<Rows>, StoreError> {
        let slot = self.balancer.select();
        let pool = self.pools.get(slot).unwrap_or(&self.pools[0]);

        let mut lease = pool.acquire().await?;
        let timer = self.monitor.begin(fp, kind, table);

        match lease.execute(query, params).await {
            Ok(rows) => {
                let returned = rows.len() as u64;
                timer.finish(true, rows.rows_affected(), returned, None);
                Ok(Arc::new(rows))
            },
            Err(e) => {
                timer.finish(false, 0, 0, Some(&e.to_string()));
                Err(e)
            },
        }
    }

    /// Invalidate every cached result for a table. For callers that write
    /// around the executor.
    pub fn invalidate_table(&self, table: &str) -> usize {
        self.cache.invalidate_by_table(table)
    }

    /// Invalidate every cached result with the given key prefix.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.cache.invalidate_by_prefix(prefix)
    }

    /// Drop the whole cache.
    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    /// Cache statistics passthrough.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Shared cache handle.
    #[must_use]
    pub fn cache(&self) -> Arc<QueryCache> {
        Arc::clone(&self.cache)
    }

    /// Shared monitor handle.
    #[must_use]
    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Start the periodic expired-entry sweep. No-op if already running.
    pub fn start_sweeper(&self, interval: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let cache = Arc::clone(&self.cache);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        cache.sweep_expired();
                    },
                }
            }
        });
        *sweeper = Some((cancel, handle));
    }

    /// Stop the periodic sweep, if running.
    pub async fn stop_sweeper(&self) {
        let taken = self.sweeper.lock().take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Shut down every pool behind this executor.
    pub async fn shutdown(&self) {
        self.stop_sweeper().await;
        for pool in &self.pools {
            pool.shutdown().await;
        }
    }
}

impl std::fmt::Debug for CachedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedExecutor")
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PoolConfig};
    use crate::conninfo::ConnectionInfo;
    use crate::driver::MemoryDriver;

    async fn executor() -> (CachedExecutor, Arc<crate::driver::MemoryStore>) {
        let driver = Arc::new(MemoryDriver::new());
        let store = driver.store();
        let monitor = Arc::new(PerformanceMonitor::with_defaults());
        let pool = ConnectionPool::connect(
            driver,
            ConnectionInfo::parse("memory://local/test").unwrap(),
            PoolConfig {
                min_connections: 1,
                max_connections: 2,
                connection_timeout_secs: 1,
                ..PoolConfig::default()
            },
            Arc::clone(&monitor),
        )
        .await
        .unwrap();
        let cache = Arc::new(QueryCache::new(CacheConfig::default()));
        (CachedExecutor::single(cache, Arc::new(pool), monitor), store)
    }

    fn p(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[tokio::test]
    async fn test_read_miss_then_hit_then_write_invalidates() {
        let (executor, _store) = executor().await;

        executor
            .execute(
                "INSERT INTO users (id, name) VALUES ($1, $2)",
                &p(&["u1", "ada"]),
                QueryKind::Insert,
                "users",
            )
            .await
            .unwrap();

        let q = "SELECT name FROM users WHERE id = $1";
        let first = executor
            .execute(q, &p(&["u1"]), QueryKind::Select, "users")
            .await
            .unwrap();
        assert_eq!(first.row(0).unwrap().get_string("name"), "ada");
        assert_eq!(executor.cache_stats().hits, 0);

        // Second read: served from cache.
        let second = executor
            .execute(q, &p(&["u1"]), QueryKind::Select, "users")
            .await
            .unwrap();
        assert_eq!(second.row(0).unwrap().get_string("name"), "ada");
        assert_eq!(executor.cache_stats().hits, 1);

        // Write to the table: third read misses again and sees new data.
        executor
            .execute(
                "UPDATE users SET name = $2 WHERE id = $1",
                &p(&["u1", "grace"]),
                QueryKind::Update,
                "users",
            )
            .await
            .unwrap();
        let third = executor
            .execute(q, &p(&["u1"]), QueryKind::Select, "users")
            .await
            .unwrap();
        assert_eq!(third.row(0).unwrap().get_string("name"), "grace");
        assert_eq!(executor.cache_stats().hits, 1, "post-write read was a miss");
    }

    #[tokio::test]
    async fn test_uncached_execution_skips_cache() {
        let (executor, _store) = executor().await;
        executor
            .execute_uncached("SELECT COUNT(*) FROM users", &[], QueryKind::Select, "users")
            .await
            .unwrap();
        assert_eq!(executor.cache_stats().size, 0);
        assert_eq!(executor.cache_stats().misses, 0, "uncached path never touches the cache");
    }

    #[tokio::test]
    async fn test_driver_errors_propagate_and_are_recorded() {
        let (executor, _store) = executor().await;
        let monitor = executor.monitor();
        let err = executor
            .execute("FROBNICATE", &[], QueryKind::Other, "users")
            .await
            .expect_err("unsupported statement");
        assert!(matches!(err, StoreError::Storage { .. }));

        let fp = fingerprint("FROBNICATE");
        assert_eq!(monitor.query_stats(&fp).unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_execute_times_queries() {
        let (executor, _store) = executor().await;
        let monitor = executor.monitor();
        executor
            .execute("SELECT COUNT(*) FROM t", &[], QueryKind::Select, "t")
            .await
            .unwrap();
        let fp = fingerprint("SELECT COUNT(*) FROM t");
        let stats = monitor.query_stats(&fp).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.successful, 1);
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let (executor, _store) = executor().await;
        executor.start_sweeper(Duration::from_millis(10));
        executor.start_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        executor.stop_sweeper().await;
        executor.shutdown().await;
    }
}
