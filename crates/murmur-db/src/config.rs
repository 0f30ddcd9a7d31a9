//! Configuration for the data-access substrate.
//!
//! Every component takes its tunables from one of the structs below. All of
//! them are serde-compatible so deployments can load them from whatever
//! configuration source the host process uses; defaults are production-safe
//! for a small service.

use std::time::Duration;

use murmur_error::ConfigError;
use serde::{Deserialize, Serialize};

use crate::conninfo::SslMode;

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections created eagerly and kept as the floor during reaping.
    pub min_connections: usize,

    /// Hard upper bound on live connections.
    pub max_connections: usize,

    /// Idle connections older than this are reaped, down to `min_connections`.
    pub idle_timeout_secs: u64,

    /// How long `acquire` waits before failing with a timeout.
    pub connection_timeout_secs: u64,

    /// Per-query execution budget handed to drivers.
    pub query_timeout_secs: u64,

    /// Whether to request TLS from the backend.
    pub enable_ssl: bool,

    /// TLS negotiation mode; only consulted when `enable_ssl` is set.
    pub ssl_mode: SslMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 20,
            idle_timeout_secs: 300,
            connection_timeout_secs: 30,
            query_timeout_secs: 60,
            enable_ssl: false,
            ssl_mode: SslMode::Prefer,
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Acquire timeout as a [`Duration`].
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Validate bounds. Called by the pool constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::validation("max_connections", "must be > 0"));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::validation(
                "min_connections",
                "must not exceed max_connections",
            ));
        }
        if self.connection_timeout_secs == 0 {
            return Err(ConfigError::validation("connection_timeout_secs", "must be > 0"));
        }
        Ok(())
    }
}

/// Pool optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Whether sizing recommendations are produced at all.
    pub enable_dynamic_sizing: bool,

    /// Sizing floor for recommendations.
    pub min_connections: usize,

    /// Sizing ceiling for recommendations.
    pub max_connections: usize,

    /// Utilization the optimizer steers toward (0.0 to 1.0).
    pub target_utilization: f64,

    /// Connections older than this are recommended for recycling.
    pub max_connection_age_secs: u64,

    /// Cadence of per-connection liveness tests.
    pub connection_test_interval_secs: u64,

    /// Liveness failures tolerated before a connection is recommended
    /// for recycling.
    pub max_failed_health_checks: u32,

    /// Cadence of the health loop.
    pub health_check_interval_secs: u64,

    /// Acceptable average connection wait before health is docked.
    pub max_connection_wait_time_ms: u64,

    /// Acceptable query error rate before health is docked (0.0 to 1.0).
    pub max_error_rate: f64,

    /// Whether timeout recommendations adapt to observed latency.
    pub enable_adaptive_timeouts: bool,

    /// Whether recycling recommendations are produced.
    pub enable_connection_recycling: bool,

    /// Whether the deployment spreads load over multiple pools.
    pub enable_load_balancing: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_dynamic_sizing: true,
            min_connections: 5,
            max_connections: 50,
            target_utilization: 0.7,
            max_connection_age_secs: 3600,
            connection_test_interval_secs: 60,
            max_failed_health_checks: 3,
            health_check_interval_secs: 30,
            max_connection_wait_time_ms: 5000,
            max_error_rate: 0.05,
            enable_adaptive_timeouts: true,
            enable_connection_recycling: true,
            enable_load_balancing: false,
        }
    }
}

impl OptimizerConfig {
    /// Validate bounds. Called by the optimizer constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::validation("max_connections", "must be > 0"));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::validation(
                "min_connections",
                "must not exceed max_connections",
            ));
        }
        if !(0.0..=1.0).contains(&self.target_utilization) {
            return Err(ConfigError::validation("target_utilization", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(ConfigError::validation("max_error_rate", "must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Query cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch; a disabled cache misses on every `get` and drops
    /// every `put`, which keeps test runs deterministic.
    pub enabled: bool,

    /// Entry-count bound; exceeding it evicts coldest-first.
    pub max_entries: usize,

    /// Results larger than this are never cached.
    pub max_result_size: usize,

    /// TTL applied when neither the caller nor the per-table rules
    /// supply one.
    pub default_ttl_secs: u64,

    /// Reserved: compress stored results. Currently tracked in config so
    /// deployments can pre-declare intent, but results are stored verbatim.
    pub enable_compression: bool,

    /// Hit rate below which `is_healthy` reports false once the cache
    /// has seen enough traffic to judge.
    pub hit_rate_threshold: f64,

    /// Cadence of the eager expired-entry sweep.
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            max_result_size: 1024 * 1024,
            default_ttl_secs: 30 * 60,
            enable_compression: true,
            hit_rate_threshold: 0.8,
            cleanup_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    /// Create cache configuration with caching disabled.
    ///
    /// Useful for testing and debugging when you want deterministic
    /// behavior without cached results.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Default TTL as a [`Duration`].
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Validate bounds. Called by the cache constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::validation("max_entries", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.hit_rate_threshold) {
            return Err(ConfigError::validation("hit_rate_threshold", "must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Performance monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfThresholds {
    /// Queries at or above this duration land in the slow-query buffer
    /// and raise a slow-query alert.
    pub slow_query_ms: u64,

    /// Queries above this duration raise a very-slow-query alert instead.
    pub very_slow_query_ms: u64,

    /// Average connection wait considered acceptable.
    pub max_connection_wait_time_ms: u64,

    /// Failed-query percentage above which the monitor reports unhealthy.
    pub max_failed_queries_percent: f64,

    /// Pool utilization above which the monitor reports unhealthy
    /// (0.0 to 1.0).
    pub max_connection_pool_utilization: f64,

    /// Fraction of `begin` calls that are actually recorded (0.0 to 1.0).
    pub sampling_rate: f64,

    /// Capacity of the recent-query ring buffer.
    pub recent_window: usize,

    /// Capacity of the slow-query ring buffer.
    pub slow_window: usize,
}

impl Default for PerfThresholds {
    fn default() -> Self {
        Self {
            slow_query_ms: 100,
            very_slow_query_ms: 1000,
            max_connection_wait_time_ms: 5000,
            max_failed_queries_percent: 5.0,
            max_connection_pool_utilization: 0.8,
            sampling_rate: 1.0,
            recent_window: 1000,
            slow_window: 1000,
        }
    }
}

impl PerfThresholds {
    /// Validate bounds. Called by the monitor constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::validation("sampling_rate", "must be within [0, 1]"));
        }
        if self.very_slow_query_ms < self.slow_query_ms {
            return Err(ConfigError::validation(
                "very_slow_query_ms",
                "must be >= slow_query_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(OptimizerConfig::default().validate().is_ok());
        assert!(CacheConfig::default().validate().is_ok());
        assert!(PerfThresholds::default().validate().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_inverted_bounds() {
        let config = PoolConfig {
            min_connections: 30,
            max_connections: 20,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_optimizer_rejects_bad_error_rate() {
        let config = OptimizerConfig {
            max_error_rate: 1.5,
            ..OptimizerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_disabled_constructor() {
        let config = CacheConfig::disabled();
        assert!(!config.enabled);
        assert_eq!(config.max_entries, CacheConfig::default().max_entries);
    }

    #[test]
    fn test_thresholds_reject_inverted_slow_bounds() {
        let thresholds = PerfThresholds {
            slow_query_ms: 2000,
            very_slow_query_ms: 1000,
            ..PerfThresholds::default()
        };
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = PoolConfig::default();
        let json = serde_json::to_string(&config).expect("serializable");
        let back: PoolConfig = serde_json::from_str(&json).expect("deserializable");
        assert_eq!(config.max_connections, back.max_connections);
        assert_eq!(config.ssl_mode, back.ssl_mode);
    }
}
