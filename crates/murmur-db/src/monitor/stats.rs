//! Query samples and per-fingerprint aggregation.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::QueryKind;

/// Samples retained per fingerprint for percentile computation.
const PERCENTILE_WINDOW: usize = 256;

/// One completed query observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySample {
    /// Query fingerprint (hash of the statement text).
    pub fingerprint: String,
    /// Statement classification.
    pub kind: QueryKind,
    /// Table the statement targets.
    pub table: String,
    /// Wall-clock execution time in microseconds.
    pub duration_us: u64,
    /// Rows affected, for writes.
    pub rows_affected: u64,
    /// Rows returned, for reads.
    pub rows_returned: u64,
    /// Whether the driver reported success.
    pub success: bool,
    /// Driver error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When execution began.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
}

/// Incrementally maintained statistics for one query fingerprint.
///
/// All updates are O(1) except percentile reads, which sort the bounded
/// window (≤ 256 samples) on demand.
#[derive(Debug, Clone)]
pub struct QueryStats {
    total: u64,
    successful: u64,
    failed: u64,
    min_us: u64,
    max_us: u64,
    mean_us: f64,
    window: VecDeque<u64>,
}

impl Default for QueryStats {
    fn default() -> Self {
        Self {
            total: 0,
            successful: 0,
            failed: 0,
            min_us: u64::MAX,
            max_us: 0,
            mean_us: 0.0,
            window: VecDeque::with_capacity(PERCENTILE_WINDOW),
        }
    }
}

impl QueryStats {
    /// Fold one observation into the aggregate.
    pub fn update(&mut self, duration_us: u64, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.min_us = self.min_us.min(duration_us);
        self.max_us = self.max_us.max(duration_us);
        // Running mean; total is already incremented.
        self.mean_us += (duration_us as f64 - self.mean_us) / self.total as f64;

        if self.window.len() == PERCENTILE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(duration_us);
    }

    /// Percentile over the retained window, naive sort-and-index.
    #[must_use]
    pub fn percentile(&self, p: f64) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let index = ((p / 100.0) * sorted.len() as f64) as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    /// Immutable snapshot for observability surfaces.
    #[must_use]
    pub fn snapshot(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            min_us: if self.total == 0 { 0 } else { self.min_us },
            max_us: self.max_us,
            mean_us: self.mean_us,
            p95_us: self.percentile(95.0),
            p99_us: self.percentile(99.0),
        }
    }

    /// Total observations folded in.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Failed observations folded in.
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.failed
    }
}

/// Serializable view of [`QueryStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStatsSnapshot {
    /// Total observations.
    pub total: u64,
    /// Successful observations.
    pub successful: u64,
    /// Failed observations.
    pub failed: u64,
    /// Fastest observation (µs).
    pub min_us: u64,
    /// Slowest observation (µs).
    pub max_us: u64,
    /// Running mean (µs).
    pub mean_us: f64,
    /// 95th percentile over the retained window (µs).
    pub p95_us: u64,
    /// 99th percentile over the retained window (µs).
    pub p99_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_tracks_min_max_mean() {
        let mut stats = QueryStats::default();
        stats.update(100, true);
        stats.update(300, true);
        stats.update(200, false);

        let snap = stats.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.successful, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.min_us, 100);
        assert_eq!(snap.max_us, 300);
        assert!((snap.mean_us - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_over_window() {
        let mut stats = QueryStats::default();
        for i in 1..=100 {
            stats.update(i, true);
        }
        assert_eq!(stats.percentile(95.0), 96);
        assert_eq!(stats.percentile(99.0), 100);
        assert_eq!(stats.percentile(0.0), 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut stats = QueryStats::default();
        for i in 0..10_000u64 {
            stats.update(i, true);
        }
        assert_eq!(stats.total(), 10_000);
        assert!(stats.window.len() <= PERCENTILE_WINDOW);
        // Percentiles reflect the recent window, not all history.
        assert!(stats.percentile(50.0) > 9_000);
    }

    #[test]
    fn test_empty_snapshot_is_zeroed() {
        let snap = QueryStats::default().snapshot();
        assert_eq!(snap.min_us, 0);
        assert_eq!(snap.p95_us, 0);
    }
}
