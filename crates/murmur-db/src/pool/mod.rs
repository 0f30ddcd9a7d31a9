//! Bounded connection pool with idle reaping and health probing (C3).
//!
//! Connections move `idle → in_use → idle | reaped`. The pool fills to
//! `min_connections` at construction; a failed fill leaves it unhealthy
//! but still serving future acquires. Waiters park on a `Notify` until a
//! connection is released, the pool can grow, or shutdown begins. Two
//! background workers cooperate through a cancellation token: the idle
//! reaper (every ~30 s) and the health monitor (every ~60 s).

mod lease;

pub use lease::{PooledConnection, Transaction};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use murmur_error::{MurmurError, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::conninfo::ConnectionInfo;
use crate::driver::{StorageConnection, StorageDriver};
use crate::monitor::PerformanceMonitor;

/// Reaper cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(30);
/// Health probe cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);
/// Liveness failures tolerated before an idle connection is dropped.
const MAX_HEALTH_FAILURES: u32 = 3;

struct IdleConn {
    conn: Box<dyn StorageConnection>,
    id: u64,
    created: Instant,
    last_used: Instant,
    health_failures: u32,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConn>,
    total: usize,
    next_id: u64,
}

pub(crate) struct PoolShared {
    driver: Arc<dyn StorageDriver>,
    info: ConnectionInfo,
    config: PoolConfig,
    monitor: Arc<PerformanceMonitor>,
    state: Mutex<PoolState>,
    notify: Notify,
    cancel: CancellationToken,
    shutdown: AtomicBool,
    healthy: AtomicBool,
}

impl PoolShared {
    /// Return a connection to the idle set and wake one waiter. During
    /// shutdown the connection is dropped instead.
    pub(crate) fn release(&self, conn: Box<dyn StorageConnection>, id: u64, created: Instant) {
        if self.shutdown.load(Ordering::Acquire) {
            self.discard();
            return;
        }
        {
            let mut state = self.state.lock();
            state.idle.push(IdleConn {
                conn,
                id,
                created,
                last_used: Instant::now(),
                health_failures: 0,
            });
        }
        self.monitor.record_connection_released();
        self.notify.notify_one();
    }

    /// Account for a connection that will not come back.
    pub(crate) fn discard(&self) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
        }
        self.monitor.record_connection_destroyed();
        self.notify.notify_one();
    }
}

/// Per-pool statistics snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live connections (idle + leased).
    pub total: usize,
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Connections currently leased.
    pub active: usize,
    /// Whether the pool believes itself healthy.
    pub healthy: bool,
}

/// Bounded pool of live storage connections.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Build a pool and fill it to `min_connections`.
    ///
    /// A failed initial fill logs, marks the pool unhealthy and keeps the
    /// connections that did come up; later acquires retry creation.
    ///
    /// # Errors
    ///
    /// Returns [`MurmurError::Config`] when the configuration is invalid.
    pub async fn connect(
        driver: Arc<dyn StorageDriver>,
        info: ConnectionInfo,
        config: PoolConfig,
        monitor: Arc<PerformanceMonitor>,
    ) -> Result<Self, MurmurError> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            driver,
            info,
            config,
            monitor,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        });

        // Synchronous fill to the floor.
        for _ in 0..shared.config.min_connections {
            match shared.driver.connect(&shared.info).await {
                Ok(conn) => {
                    let mut state = shared.state.lock();
                    let id = state.next_id;
                    state.next_id += 1;
                    state.total += 1;
                    state.idle.push(IdleConn {
                        conn,
                        id,
                        created: Instant::now(),
                        last_used: Instant::now(),
                        health_failures: 0,
                    });
                    drop(state);
                    shared.monitor.record_connection_created();
                },
                Err(e) => {
                    warn!(error = %e, "initial pool fill failed; pool starts unhealthy");
                    shared.monitor.record_connection_error();
                    shared.healthy.store(false, Ordering::Release);
                    break;
                },
            }
        }

        let pool = Self {
            workers: Mutex::new(Vec::new()),
            shared,
        };
        pool.spawn_workers();
        info!(
            total = pool.stats().total,
            min = pool.shared.config.min_connections,
            max = pool.shared.config.max_connections,
            "connection pool ready"
        );
        Ok(pool)
    }

    /// Acquire a connection lease.
    ///
    /// Returns an idle connection if one exists, grows the pool if below
    /// `max_connections`, and otherwise waits until a release or shutdown.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConnectionTimeout`] when `connection_timeout` elapses
    /// first (counted by the monitor), [`StoreError::Shutdown`] after
    /// shutdown begins, [`StoreError::Storage`] when growing the pool
    /// fails at the driver.
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + self.shared.config.connection_timeout());

        enum Plan {
            Lease(Box<IdleConn>),
            Create(u64),
            Wait,
        }

        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(StoreError::Shutdown);
            }

            let plan = {
                let mut state = self.shared.state.lock();
                if let Some(idle) = state.idle.pop() {
                    Plan::Lease(Box::new(idle))
                } else if state.total < self.shared.config.max_connections {
                    // Reserve the slot before the await; a failed create
                    // releases it below.
                    state.total += 1;
                    let id = state.next_id;
                    state.next_id += 1;
                    Plan::Create(id)
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Lease(idle) => {
                    self.shared.monitor.record_connection_acquired();
                    self.shared.monitor.record_connection_wait(start.elapsed());
                    let idle = *idle;
                    return Ok(PooledConnection {
                        conn: Some(idle.conn),
                        shared: Arc::clone(&self.shared),
                        id: idle.id,
                        created: idle.created,
                        pending_rollback: false,
                    });
                },
                Plan::Create(id) => match self.shared.driver.connect(&self.shared.info).await {
                    Ok(conn) => {
                        self.shared.monitor.record_connection_created();
                        self.shared.monitor.record_connection_acquired();
                        self.shared.monitor.record_connection_wait(start.elapsed());
                        return Ok(PooledConnection {
                            conn: Some(conn),
                            shared: Arc::clone(&self.shared),
                            id,
                            created: Instant::now(),
                            pending_rollback: false,
                        });
                    },
                    Err(e) => {
                        {
                            let mut state = self.shared.state.lock();
                            state.total = state.total.saturating_sub(1);
                        }
                        self.shared.notify.notify_one();
                        self.shared.monitor.record_connection_error();
                        self.shared.healthy.store(false, Ordering::Release);
                        return Err(e);
                    },
                },
                Plan::Wait => {
                    tokio::select! {
                        () = self.shared.notify.notified() => {},
                        () = tokio::time::sleep_until(deadline) => {
                            self.shared.monitor.record_connection_timeout();
                            let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                            return Err(StoreError::ConnectionTimeout { waited_ms });
                        },
                        () = self.shared.cancel.cancelled() => {
                            return Err(StoreError::Shutdown);
                        },
                    }
                },
            }
        }
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
            healthy: self.is_healthy(),
        }
    }

    /// Whether the pool believes itself able to serve.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Acquire) && !self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Cooperative shutdown: wakes all waiters, stops the workers and
    /// closes every idle connection. Leased connections are dropped as
    /// they come back. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("connection pool shutting down");
        self.shared.cancel.cancel();
        self.shared.notify.notify_waiters();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            let _ = result;
        }

        let drained: Vec<IdleConn> = {
            let mut state = self.shared.state.lock();
            let drained: Vec<IdleConn> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        for mut idle in drained {
            idle.conn.close().await;
            self.shared.monitor.record_connection_destroyed();
        }
        self.shared.healthy.store(false, Ordering::Release);
    }

    fn spawn_workers(&self) {
        let mut workers = self.workers.lock();

        let shared = Arc::clone(&self.shared);
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shared.cancel.cancelled() => break,
                    () = tokio::time::sleep(REAP_INTERVAL) => reap_idle(&shared).await,
                }
            }
        }));

        let shared = Arc::clone(&self.shared);
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shared.cancel.cancelled() => break,
                    () = tokio::time::sleep(HEALTH_INTERVAL) => probe_health(&shared).await,
                }
            }
        }));
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("total", &stats.total)
            .field("idle", &stats.idle)
            .field("healthy", &stats.healthy)
            .finish_non_exhaustive()
    }
}

/// Reap idle connections past the idle timeout, never dropping below the
/// configured floor.
async fn reap_idle(shared: &Arc<PoolShared>) {
    let idle_timeout = shared.config.idle_timeout();
    let reaped: Vec<IdleConn> = {
        let mut state = shared.state.lock();
        let headroom = state.total.saturating_sub(shared.config.min_connections);
        if headroom == 0 {
            return;
        }
        let now = Instant::now();
        let mut reaped = Vec::new();
        let mut kept = Vec::with_capacity(state.idle.len());
        for idle in state.idle.drain(..) {
            if reaped.len() < headroom && now.duration_since(idle.last_used) > idle_timeout {
                reaped.push(idle);
            } else {
                kept.push(idle);
            }
        }
        state.idle = kept;
        state.total -= reaped.len();
        reaped
    };

    if reaped.is_empty() {
        return;
    }
    debug!(reaped = reaped.len(), "reaped idle connections");
    for mut idle in reaped {
        idle.conn.close().await;
        shared.monitor.record_connection_destroyed();
    }
}

/// Probe idle connections, dropping ones that keep failing, and refresh
/// the pool's health flag.
async fn probe_health(shared: &Arc<PoolShared>) {
    // Take the idle set out so probes never hold the lock across awaits.
    let mut idle: Vec<IdleConn> = {
        let mut state = shared.state.lock();
        state.idle.drain(..).collect()
    };

    let mut kept = Vec::with_capacity(idle.len());
    let mut dropped = 0usize;
    for mut conn in idle.drain(..) {
        if conn.conn.is_alive().await {
            conn.health_failures = 0;
            kept.push(conn);
        } else {
            conn.health_failures += 1;
            if conn.health_failures >= MAX_HEALTH_FAILURES {
                dropped += 1;
                conn.conn.close().await;
                shared.monitor.record_connection_destroyed();
            } else {
                kept.push(conn);
            }
        }
    }

    let (total, healthy) = {
        let mut state = shared.state.lock();
        state.total = state.total.saturating_sub(dropped);
        let kept_len = kept.len();
        state.idle.extend(kept);
        (state.total, state.total > 0 || kept_len > 0)
    };
    for _ in 0..dropped {
        shared.notify.notify_one();
    }

    let healthy = healthy && total >= shared.config.min_connections.min(1);
    shared.healthy.store(healthy, Ordering::Release);
    if !healthy {
        warn!(total, "connection pool unhealthy");
    }
}
