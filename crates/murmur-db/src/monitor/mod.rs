//! Performance monitoring for query execution and connection lifecycle.
//!
//! The monitor sits on every query path, so all mutation of aggregates is
//! O(1) amortized and never blocks execution: aggregates live under one
//! short-lived mutex, active-query tracking uses a sharded map so reads of
//! the aggregates never contend with begins/ends, and connection counters
//! are plain atomics.
//!
//! There is deliberately no global instance. Construct one
//! [`PerformanceMonitor`] per process, share it via `Arc`, and hand tests
//! their own isolated instances.

mod alert;
mod stats;

pub use alert::{PerformanceAlertKind, PerformanceAlertSink};
pub use stats::{QuerySample, QueryStats, QueryStatsSnapshot};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PerfThresholds;
use crate::driver::QueryKind;

/// Connection lifecycle counters, as a serializable snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Connections created since start/reset.
    pub created: u64,
    /// Connections destroyed since start/reset.
    pub destroyed: u64,
    /// Acquire operations completed.
    pub acquired: u64,
    /// Release operations completed.
    pub released: u64,
    /// Acquire timeouts.
    pub timeouts: u64,
    /// Driver-level connection errors.
    pub errors: u64,
    /// Currently leased connections (`acquired - released`).
    pub active: u64,
    /// Peak of `active`.
    pub peak_active: u64,
    /// Mean connection wait (µs).
    pub wait_avg_us: u64,
    /// Worst connection wait (µs).
    pub wait_max_us: u64,
}

#[derive(Debug)]
struct ActiveQuery {
    fingerprint: String,
    started: Instant,
}

#[derive(Default)]
struct MonitorInner {
    aggregates: HashMap<String, QueryStats>,
    recent: VecDeque<QuerySample>,
    slow: VecDeque<QuerySample>,
}

#[derive(Default)]
struct ConnCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    peak_active: AtomicU64,
    wait_total_us: AtomicU64,
    wait_samples: AtomicU64,
    wait_max_us: AtomicU64,
}

/// Per-process metric aggregation point (C1).
pub struct PerformanceMonitor {
    thresholds: PerfThresholds,
    enabled: AtomicBool,
    sampling_bits: AtomicU64,
    inner: Mutex<MonitorInner>,
    active: DashMap<u64, ActiveQuery>,
    next_id: AtomicU64,
    conn: ConnCounters,
    sink: RwLock<Option<Arc<dyn PerformanceAlertSink>>>,
}

impl PerformanceMonitor {
    /// Create a monitor. The sampling rate from `thresholds` is clamped
    /// into `[0, 1]`.
    #[must_use]
    pub fn new(thresholds: PerfThresholds) -> Self {
        let sampling = thresholds.sampling_rate.clamp(0.0, 1.0);
        Self {
            thresholds,
            enabled: AtomicBool::new(true),
            sampling_bits: AtomicU64::new(sampling.to_bits()),
            inner: Mutex::new(MonitorInner::default()),
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
            conn: ConnCounters::default(),
            sink: RwLock::new(None),
        }
    }

    /// Monitor with default thresholds.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(PerfThresholds::default())
    }

    /// Register the alert sink. Passing a new sink replaces the old one.
    pub fn set_alert_sink(&self, sink: Arc<dyn PerformanceAlertSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Enable or disable all recording. When disabled every call is an
    /// O(1) no-op.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Set the fraction of begins that are recorded.
    pub fn set_sampling_rate(&self, rate: f64) {
        self.sampling_bits
            .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn sampling_rate(&self) -> f64 {
        f64::from_bits(self.sampling_bits.load(Ordering::Relaxed))
    }

    /// Start timing a query. The returned guard must be completed with
    /// [`QueryTimer::finish`]; a guard dropped without finishing records
    /// a failure.
    pub fn begin(self: &Arc<Self>, fingerprint: &str, kind: QueryKind, table: &str) -> QueryTimer {
        if !self.enabled.load(Ordering::Relaxed) {
            return QueryTimer::disarmed();
        }

        let rate = self.sampling_rate();
        let sampled = rate >= 1.0 || (rate > 0.0 && rand::random::<f64>() < rate);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            ActiveQuery {
                fingerprint: fingerprint.to_string(),
                started: Instant::now(),
            },
        );

        QueryTimer {
            monitor: Some(Arc::clone(self)),
            id,
            fingerprint: fingerprint.to_string(),
            kind,
            table: table.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            sampled,
            finished: false,
        }
    }

    fn record_end(
        &self,
        timer: &QueryTimer,
        success: bool,
        rows_affected: u64,
        rows_returned: u64,
        error: Option<&str>,
    ) {
        // The pending entry goes away whether or not the sample records.
        self.active.remove(&timer.id);
        if !timer.sampled {
            return;
        }

        let duration = timer.started.elapsed();
        let duration_us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let sample = QuerySample {
            fingerprint: timer.fingerprint.clone(),
            kind: timer.kind,
            table: timer.table.clone(),
            duration_us,
            rows_affected,
            rows_returned,
            success,
            error: error.map(str::to_string),
            started_at: timer.started_at,
        };

        {
            let mut inner = self.inner.lock();
            inner
                .aggregates
                .entry(sample.fingerprint.clone())
                .or_default()
                .update(duration_us, success);

            if inner.recent.len() >= self.thresholds.recent_window {
                inner.recent.pop_front();
            }
            inner.recent.push_back(sample.clone());

            if duration_us >= self.thresholds.slow_query_ms * 1000 {
                if inner.slow.len() >= self.thresholds.slow_window {
                    inner.slow.pop_front();
                }
                inner.slow.push_back(sample.clone());
            }
        }

        self.check_thresholds(&sample);
    }

    fn check_thresholds(&self, sample: &QuerySample) {
        let sink = self.sink.read();
        let Some(sink) = sink.as_ref() else {
            return;
        };

        let duration_ms = sample.duration_us / 1000;
        if duration_ms > self.thresholds.very_slow_query_ms {
            sink.performance_alert(
                PerformanceAlertKind::VerySlowQuery,
                &format!(
                    "query {} on {} took {}ms (very-slow threshold {}ms)",
                    sample.fingerprint, sample.table, duration_ms, self.thresholds.very_slow_query_ms
                ),
                sample,
            );
        } else if duration_ms > self.thresholds.slow_query_ms {
            sink.performance_alert(
                PerformanceAlertKind::SlowQuery,
                &format!(
                    "query {} on {} took {}ms (slow threshold {}ms)",
                    sample.fingerprint, sample.table, duration_ms, self.thresholds.slow_query_ms
                ),
                sample,
            );
        }
        if !sample.success {
            sink.performance_alert(
                PerformanceAlertKind::QueryFailure,
                &format!(
                    "query {} on {} failed: {}",
                    sample.fingerprint,
                    sample.table,
                    sample.error.as_deref().unwrap_or("unknown error")
                ),
                sample,
            );
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    /// A connection was created by the pool.
    pub fn record_connection_created(&self) {
        self.bump(&self.conn.created);
    }

    /// A connection was closed or reaped.
    pub fn record_connection_destroyed(&self) {
        self.bump(&self.conn.destroyed);
    }

    /// A lease was handed out.
    pub fn record_connection_acquired(&self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.conn.acquired.fetch_add(1, Ordering::Relaxed);
        let active = self
            .conn
            .acquired
            .load(Ordering::Relaxed)
            .saturating_sub(self.conn.released.load(Ordering::Relaxed));
        self.conn.peak_active.fetch_max(active, Ordering::Relaxed);
    }

    /// A lease was returned.
    pub fn record_connection_released(&self) {
        self.bump(&self.conn.released);
    }

    /// An acquire timed out.
    pub fn record_connection_timeout(&self) {
        self.bump(&self.conn.timeouts);
    }

    /// The driver failed to create or use a connection.
    pub fn record_connection_error(&self) {
        self.bump(&self.conn.errors);
    }

    /// How long an acquire waited before being served.
    pub fn record_connection_wait(&self, wait: Duration) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let us = u64::try_from(wait.as_micros()).unwrap_or(u64::MAX);
        self.conn.wait_total_us.fetch_add(us, Ordering::Relaxed);
        self.conn.wait_samples.fetch_add(1, Ordering::Relaxed);
        self.conn.wait_max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ── Retrieval ────────────────────────────────────────────────────────

    /// Snapshot of the connection counters.
    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        let acquired = self.conn.acquired.load(Ordering::Relaxed);
        let released = self.conn.released.load(Ordering::Relaxed);
        let wait_samples = self.conn.wait_samples.load(Ordering::Relaxed);
        ConnectionStats {
            created: self.conn.created.load(Ordering::Relaxed),
            destroyed: self.conn.destroyed.load(Ordering::Relaxed),
            acquired,
            released,
            timeouts: self.conn.timeouts.load(Ordering::Relaxed),
            errors: self.conn.errors.load(Ordering::Relaxed),
            active: acquired.saturating_sub(released),
            peak_active: self.conn.peak_active.load(Ordering::Relaxed),
            wait_avg_us: if wait_samples == 0 {
                0
            } else {
                self.conn.wait_total_us.load(Ordering::Relaxed) / wait_samples
            },
            wait_max_us: self.conn.wait_max_us.load(Ordering::Relaxed),
        }
    }

    /// Aggregated statistics for one fingerprint.
    #[must_use]
    pub fn query_stats(&self, fingerprint: &str) -> Option<QueryStatsSnapshot> {
        self.inner
            .lock()
            .aggregates
            .get(fingerprint)
            .map(QueryStats::snapshot)
    }

    /// Overall failed fraction across all fingerprints, 0.0 when idle.
    #[must_use]
    pub fn overall_error_rate(&self) -> f64 {
        let inner = self.inner.lock();
        let (total, failed) = inner
            .aggregates
            .values()
            .fold((0u64, 0u64), |(t, f), s| (t + s.total(), f + s.failed()));
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    /// Most recent samples, newest last.
    #[must_use]
    pub fn recent_queries(&self, limit: usize) -> Vec<QuerySample> {
        let inner = self.inner.lock();
        inner.recent.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Samples that crossed the slow threshold, newest last.
    #[must_use]
    pub fn slow_queries(&self, limit: usize) -> Vec<QuerySample> {
        let inner = self.inner.lock();
        inner.slow.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Queries currently in flight as `(fingerprint, elapsed)`.
    #[must_use]
    pub fn active_queries(&self) -> Vec<(String, Duration)> {
        self.active
            .iter()
            .map(|entry| (entry.fingerprint.clone(), entry.started.elapsed()))
            .collect()
    }

    /// Number of queries currently in flight.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether observed behavior is within the configured thresholds.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let error_ok = self.overall_error_rate() * 100.0 <= self.thresholds.max_failed_queries_percent;
        let stats = self.connection_stats();
        let wait_ok = stats.wait_avg_us <= self.thresholds.max_connection_wait_time_ms * 1000;
        error_ok && wait_ok
    }

    /// Thresholds this monitor was built with.
    #[must_use]
    pub const fn thresholds(&self) -> &PerfThresholds {
        &self.thresholds
    }

    /// Drop retained samples older than `max_age`. Aggregates are kept.
    pub fn clear_old_samples(&self, max_age: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut inner = self.inner.lock();
        inner.recent.retain(|s| s.started_at >= cutoff);
        inner.slow.retain(|s| s.started_at >= cutoff);
    }

    /// Reset every aggregate, window and counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.aggregates.clear();
        inner.recent.clear();
        inner.slow.clear();
        drop(inner);
        for counter in [
            &self.conn.created,
            &self.conn.destroyed,
            &self.conn.acquired,
            &self.conn.released,
            &self.conn.timeouts,
            &self.conn.errors,
            &self.conn.peak_active,
            &self.conn.wait_total_us,
            &self.conn.wait_samples,
            &self.conn.wait_max_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// RAII guard for one timed query.
///
/// Obtained from [`PerformanceMonitor::begin`]; completed with
/// [`QueryTimer::finish`]. Dropping an unfinished armed timer records the
/// query as failed, so abandoned executions still show up in the failure
/// statistics.
#[derive(Debug)]
pub struct QueryTimer {
    monitor: Option<Arc<PerformanceMonitor>>,
    id: u64,
    fingerprint: String,
    kind: QueryKind,
    table: String,
    started: Instant,
    started_at: DateTime<Utc>,
    sampled: bool,
    finished: bool,
}

impl QueryTimer {
    fn disarmed() -> Self {
        Self {
            monitor: None,
            id: 0,
            fingerprint: String::new(),
            kind: QueryKind::Other,
            table: String::new(),
            started: Instant::now(),
            started_at: Utc::now(),
            sampled: false,
            finished: true,
        }
    }

    /// Complete the timer with the execution outcome.
    pub fn finish(mut self, success: bool, rows_affected: u64, rows_returned: u64, error: Option<&str>) {
        self.finished = true;
        if let Some(monitor) = self.monitor.take() {
            monitor.record_end(&self, success, rows_affected, rows_returned, error);
        }
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(monitor) = self.monitor.take() {
            warn!(fingerprint = %self.fingerprint, "query timer dropped without finish");
            monitor.record_end(self, false, 0, 0, Some("query timer dropped"));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct CollectingSink {
        alerts: PlMutex<Vec<(PerformanceAlertKind, String)>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                alerts: PlMutex::new(Vec::new()),
            })
        }
    }

    impl PerformanceAlertSink for CollectingSink {
        fn performance_alert(&self, kind: PerformanceAlertKind, message: &str, _sample: &QuerySample) {
            self.alerts.lock().push((kind, message.to_string()));
        }
    }

    fn monitor() -> Arc<PerformanceMonitor> {
        Arc::new(PerformanceMonitor::with_defaults())
    }

    // ========================================================================
    // Timing and aggregation
    // ========================================================================

    #[test]
    fn test_begin_finish_updates_aggregates() {
        let monitor = monitor();
        let timer = monitor.begin("fp1", QueryKind::Select, "users");
        timer.finish(true, 0, 3, None);

        let snap = monitor.query_stats("fp1").expect("aggregate exists");
        assert_eq!(snap.total, 1);
        assert_eq!(snap.successful, 1);
        assert_eq!(monitor.active_count(), 0);
    }

    #[test]
    fn test_dropped_timer_counts_as_failure() {
        let monitor = monitor();
        {
            let _timer = monitor.begin("fp_drop", QueryKind::Select, "users");
        }
        let snap = monitor.query_stats("fp_drop").expect("aggregate exists");
        assert_eq!(snap.failed, 1);
        assert_eq!(monitor.active_count(), 0);
    }

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let monitor = monitor();
        monitor.set_enabled(false);
        let timer = monitor.begin("fp2", QueryKind::Select, "users");
        timer.finish(true, 0, 1, None);

        assert!(monitor.query_stats("fp2").is_none());
        assert_eq!(monitor.connection_stats().acquired, 0);
    }

    #[test]
    fn test_zero_sampling_keeps_pending_count_balanced() {
        let monitor = monitor();
        monitor.set_sampling_rate(0.0);
        let timer = monitor.begin("fp3", QueryKind::Select, "users");
        assert_eq!(monitor.active_count(), 1);
        timer.finish(true, 0, 1, None);

        assert_eq!(monitor.active_count(), 0);
        assert!(monitor.query_stats("fp3").is_none(), "unsampled ends record nothing");
    }

    #[test]
    fn test_recent_buffer_is_bounded() {
        let thresholds = PerfThresholds {
            recent_window: 10,
            ..PerfThresholds::default()
        };
        let monitor = Arc::new(PerformanceMonitor::new(thresholds));
        for i in 0..50 {
            let timer = monitor.begin(&format!("fp{i}"), QueryKind::Select, "users");
            timer.finish(true, 0, 0, None);
        }
        assert_eq!(monitor.recent_queries(100).len(), 10);
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    #[test]
    fn test_failure_alert_emitted() {
        let monitor = monitor();
        let sink = CollectingSink::new();
        monitor.set_alert_sink(sink.clone());

        let timer = monitor.begin("fp_fail", QueryKind::Update, "users");
        timer.finish(false, 0, 0, Some("constraint violation"));

        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, PerformanceAlertKind::QueryFailure);
        assert!(alerts[0].1.contains("constraint violation"));
    }

    #[test]
    fn test_no_sink_no_panic() {
        let monitor = monitor();
        let timer = monitor.begin("fp_ok", QueryKind::Select, "users");
        timer.finish(false, 0, 0, Some("boom"));
        assert_eq!(monitor.query_stats("fp_ok").unwrap().failed, 1);
    }

    // ========================================================================
    // Connection counters
    // ========================================================================

    #[test]
    fn test_connection_counter_snapshot() {
        let monitor = monitor();
        monitor.record_connection_created();
        monitor.record_connection_acquired();
        monitor.record_connection_acquired();
        monitor.record_connection_released();
        monitor.record_connection_timeout();
        monitor.record_connection_wait(Duration::from_micros(500));
        monitor.record_connection_wait(Duration::from_micros(1500));

        let stats = monitor.connection_stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.peak_active, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.wait_avg_us, 1000);
        assert_eq!(stats.wait_max_us, 1500);
    }

    #[test]
    fn test_reset_clears_everything() {
        let monitor = monitor();
        monitor.record_connection_created();
        let timer = monitor.begin("fp", QueryKind::Select, "t");
        timer.finish(true, 0, 0, None);

        monitor.reset();
        assert!(monitor.query_stats("fp").is_none());
        assert_eq!(monitor.connection_stats().created, 0);
    }

    #[test]
    fn test_healthy_when_idle() {
        assert!(monitor().is_healthy());
    }
}
