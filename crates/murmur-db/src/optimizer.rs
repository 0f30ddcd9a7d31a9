//! Pool optimization and health reporting (C4).
//!
//! The optimizer consumes monitor counters and periodically publishes a
//! [`PoolHealthSnapshot`] plus sizing, timeout and recycling
//! recommendations. It never resizes the pool itself: recommendations are
//! logged and surfaced so a deployment can wire them to actuators.
//!
//! Two cooperative loops start and stop together: the health loop (every
//! `health_check_interval_secs`) and the optimization loop (~30 s, pausable).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use murmur_error::MurmurError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OptimizerConfig;
use crate::monitor::PerformanceMonitor;

/// Cadence of the optimization loop.
const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(30);

/// Health severity derived from the score.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSeverity {
    /// Score ≥ 0.8.
    Healthy,
    /// Score ≥ 0.6.
    Degraded,
    /// Score ≥ 0.4.
    Unhealthy,
    /// Everything below.
    Critical,
}

impl HealthSeverity {
    /// Get the severity as a lowercase tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Critical => "critical",
        }
    }

    /// Map a score in `[0, 1]` to a severity.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::Healthy
        } else if score >= 0.6 {
            Self::Degraded
        } else if score >= 0.4 {
            Self::Unhealthy
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for HealthSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for per-cycle health alerts.
pub trait HealthAlertSink: Send + Sync {
    /// Deliver the current severity and a short description.
    fn health_alert(&self, severity: HealthSeverity, message: &str);
}

/// Point-in-time view of pool health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthSnapshot {
    /// Connections known to the monitor (created − destroyed).
    pub total: u64,
    /// Connections counted as healthy.
    pub healthy: u64,
    /// Connections counted as degraded.
    pub degraded: u64,
    /// Connections counted as unhealthy.
    pub unhealthy: u64,
    /// Mean query duration (ms) across recent samples.
    pub avg_response_time_ms: f64,
    /// Failed fraction across all fingerprints.
    pub error_rate: f64,
    /// Leased fraction of the configured maximum.
    pub utilization: f64,
    /// Mean connection wait (ms).
    pub wait_time_avg_ms: u64,
    /// Worst connection wait (ms).
    pub wait_time_max_ms: u64,
    /// Overall severity.
    pub overall: HealthSeverity,
    /// Deterministic health score in `[0, 1]`.
    pub score: f64,
}

/// Sizing and lifecycle recommendations from one optimization cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    /// Recommended pool size.
    pub target_pool_size: usize,
    /// Recommended idle timeout in seconds.
    pub target_idle_timeout_secs: u64,
    /// Whether connection recycling is recommended this cycle.
    pub recommend_recycling: bool,
    /// Cumulative effectiveness score in `[0, 1]`.
    pub effectiveness: f64,
}

/// Background controller producing health snapshots and recommendations.
pub struct PoolOptimizer {
    config: OptimizerConfig,
    monitor: Arc<PerformanceMonitor>,
    sink: Mutex<Option<Arc<dyn HealthAlertSink>>>,
    snapshot: Mutex<Option<PoolHealthSnapshot>>,
    last_report: Mutex<Option<OptimizationReport>>,
    effectiveness: Mutex<f64>,
    previous_score: Mutex<Option<f64>>,
    paused: AtomicBool,
    running: AtomicBool,
    optimization_count: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Idle timeout the recommendations start from.
    base_idle_timeout_secs: u64,
}

impl PoolOptimizer {
    /// Create an optimizer over a monitor.
    ///
    /// # Errors
    ///
    /// Returns [`MurmurError::Config`] when the configuration is invalid.
    pub fn new(
        config: OptimizerConfig,
        monitor: Arc<PerformanceMonitor>,
        base_idle_timeout_secs: u64,
    ) -> Result<Self, MurmurError> {
        config.validate()?;
        Ok(Self {
            config,
            monitor,
            sink: Mutex::new(None),
            snapshot: Mutex::new(None),
            last_report: Mutex::new(None),
            effectiveness: Mutex::new(0.5),
            previous_score: Mutex::new(None),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            optimization_count: AtomicU64::new(0),
            cancel: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            base_idle_timeout_secs,
        })
    }

    /// Register the health alert sink.
    pub fn set_alert_sink(&self, sink: Arc<dyn HealthAlertSink>) {
        *self.sink.lock() = Some(sink);
    }

    /// Start both loops. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let mut workers = self.workers.lock();

        let this = Arc::clone(self);
        let health_cancel = cancel.clone();
        let health_interval = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = health_cancel.cancelled() => break,
                    () = tokio::time::sleep(health_interval) => { this.run_health_cycle(); },
                }
            }
        }));

        let this = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(OPTIMIZE_INTERVAL) => {
                        if !this.paused.load(Ordering::Relaxed) {
                            this.run_optimization_cycle();
                        }
                    },
                }
            }
        }));
        info!("pool optimizer started");
    }

    /// Stop both loops and wait for them to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            let _ = result;
        }
        info!("pool optimizer stopped");
    }

    /// Pause the optimization loop (the health loop keeps running).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resume the optimization loop.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Latest health snapshot, if any cycle has run.
    #[must_use]
    pub fn health(&self) -> Option<PoolHealthSnapshot> {
        self.snapshot.lock().clone()
    }

    /// Latest optimization report, if any cycle has run.
    #[must_use]
    pub fn last_report(&self) -> Option<OptimizationReport> {
        self.last_report.lock().clone()
    }

    /// Number of completed optimization cycles.
    #[must_use]
    pub fn optimization_count(&self) -> u64 {
        self.optimization_count.load(Ordering::Relaxed)
    }

    /// Cumulative effectiveness score in `[0, 1]`.
    #[must_use]
    pub fn effectiveness(&self) -> f64 {
        *self.effectiveness.lock()
    }

    /// Compute one health cycle immediately (also used by the loop).
    pub fn run_health_cycle(&self) -> PoolHealthSnapshot {
        let snapshot = self.compute_health();
        let message = format!(
            "pool health {} (score {:.2}, error rate {:.3}, utilization {:.2})",
            snapshot.overall, snapshot.score, snapshot.error_rate, snapshot.utilization
        );
        match snapshot.overall {
            HealthSeverity::Healthy => debug!("{message}"),
            HealthSeverity::Degraded => info!("{message}"),
            _ => warn!("{message}"),
        }
        if let Some(sink) = self.sink.lock().clone() {
            sink.health_alert(snapshot.overall, &message);
        }
        *self.snapshot.lock() = Some(snapshot.clone());
        snapshot
    }

    /// Compute one optimization cycle immediately (also used by the loop).
    pub fn run_optimization_cycle(&self) -> OptimizationReport {
        let snapshot = self.compute_health();

        let report = OptimizationReport {
            target_pool_size: self.target_pool_size(&snapshot),
            target_idle_timeout_secs: self.target_idle_timeout(&snapshot),
            recommend_recycling: self.config.enable_connection_recycling
                && snapshot.error_rate > self.config.max_error_rate,
            effectiveness: self.update_effectiveness(snapshot.score),
        };

        info!(
            target_pool_size = report.target_pool_size,
            target_idle_timeout_secs = report.target_idle_timeout_secs,
            recommend_recycling = report.recommend_recycling,
            effectiveness = report.effectiveness,
            "pool optimization cycle"
        );

        self.optimization_count.fetch_add(1, Ordering::Relaxed);
        *self.last_report.lock() = Some(report.clone());
        report
    }

    /// Whether a connection of the given age and error count should be
    /// recycled.
    #[must_use]
    pub fn should_recycle(&self, age: Duration, error_count: u32) -> bool {
        self.config.enable_connection_recycling
            && (age.as_secs() > self.config.max_connection_age_secs
                || error_count > self.config.max_failed_health_checks)
    }

    /// Deterministic health computation from the monitor's counters.
    fn compute_health(&self) -> PoolHealthSnapshot {
        let conn = self.monitor.connection_stats();
        let error_rate = self.monitor.overall_error_rate();

        let total = conn.created.saturating_sub(conn.destroyed);
        let utilization = if self.config.max_connections == 0 {
            0.0
        } else {
            conn.active as f64 / self.config.max_connections as f64
        };
        let wait_avg_ms = conn.wait_avg_us / 1000;
        let wait_max_ms = conn.wait_max_us / 1000;

        // Unhealthy connections surface through driver-level errors since
        // the last reset.
        let unhealthy = conn.errors.min(total);

        let mut score: f64 = 1.0;
        if error_rate > self.config.max_error_rate {
            score -= 0.3;
        }
        if utilization > 0.9 {
            score -= 0.2;
        }
        if wait_avg_ms > self.config.max_connection_wait_time_ms {
            score -= 0.2;
        }
        if unhealthy > 0 {
            score -= 0.3;
        }
        let score = score.clamp(0.0, 1.0);

        let recent = self.monitor.recent_queries(100);
        let avg_response_time_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|s| s.duration_us as f64 / 1000.0).sum::<f64>() / recent.len() as f64
        };

        PoolHealthSnapshot {
            total,
            healthy: total.saturating_sub(unhealthy),
            degraded: 0,
            unhealthy,
            avg_response_time_ms,
            error_rate,
            utilization,
            wait_time_avg_ms: wait_avg_ms,
            wait_time_max_ms: wait_max_ms,
            overall: HealthSeverity::from_score(score),
            score,
        }
    }

    /// Sizing heuristic: start at the floor, scale up under load and
    /// errors, clamp into `[min, max]`.
    fn target_pool_size(&self, snapshot: &PoolHealthSnapshot) -> usize {
        if !self.config.enable_dynamic_sizing {
            return self.config.min_connections;
        }
        let mut target = self.config.min_connections as f64;
        if snapshot.utilization > 0.8 {
            target *= 1.5;
        }
        if snapshot.error_rate > self.config.max_error_rate {
            target *= 1.2;
        }
        (target.round() as usize).clamp(self.config.min_connections, self.config.max_connections)
    }

    /// Timeout heuristic: shrink under errors, stretch under latency.
    fn target_idle_timeout(&self, snapshot: &PoolHealthSnapshot) -> u64 {
        if !self.config.enable_adaptive_timeouts {
            return self.base_idle_timeout_secs;
        }
        let mut target = self.base_idle_timeout_secs as f64;
        if snapshot.error_rate > self.config.max_error_rate {
            target *= 0.7;
        }
        if snapshot.avg_response_time_ms > self.monitor.thresholds().slow_query_ms as f64 {
            target *= 1.3;
        }
        target.round() as u64
    }

    /// Nudge the cumulative effectiveness: +0.1 on improvement between
    /// cycles, −0.05 on regression, clamped into `[0, 1]`.
    fn update_effectiveness(&self, score: f64) -> f64 {
        let mut previous = self.previous_score.lock();
        let mut effectiveness = self.effectiveness.lock();
        if let Some(prev) = *previous {
            if score > prev {
                *effectiveness = (*effectiveness + 0.1).min(1.0);
            } else if score < prev {
                *effectiveness = (*effectiveness - 0.05).max(0.0);
            }
        }
        *previous = Some(score);
        *effectiveness
    }
}

impl std::fmt::Debug for PoolOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptimizer")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("optimization_count", &self.optimization_count())
            .finish_non_exhaustive()
    }
}
