//! murmur-db: the data-access substrate for Murmur services.
//!
//! This crate provides the shared machinery every repository sits on:
//!
//! - a bounded [`pool::ConnectionPool`] with idle reaping and health probing
//! - a TTL + usage-ordered [`cache::QueryCache`] with tag invalidation
//! - a [`monitor::PerformanceMonitor`] recording per-query and per-pool metrics
//! - a [`balancer::LoadBalancer`] choosing between pools per request
//! - a [`optimizer::PoolOptimizer`] turning monitor data into health
//!   snapshots and sizing recommendations
//! - the [`executor::CachedExecutor`] tying all of the above behind a single
//!   `execute(query, params, kind, table)` call
//!
//! Storage backends implement the [`driver`] traits; an in-memory backend is
//! always available for development and tests, and a PostgreSQL backend is
//! enabled by the `postgres` feature.

pub mod balancer;
pub mod cache;
pub mod config;
pub mod conninfo;
pub mod driver;
pub mod executor;
pub mod monitor;
pub mod optimizer;
pub mod pool;

pub use balancer::{BalancingStrategy, LoadBalancer};
pub use cache::QueryCache;
pub use config::{CacheConfig, OptimizerConfig, PerfThresholds, PoolConfig};
pub use conninfo::{ConnectionInfo, SslMode};
pub use driver::{QueryKind, Rows, StorageConnection, StorageDriver};
pub use executor::CachedExecutor;
pub use monitor::PerformanceMonitor;
pub use optimizer::{HealthSeverity, PoolOptimizer};
pub use pool::ConnectionPool;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
