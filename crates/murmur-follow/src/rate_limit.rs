//! Fixed-window rate limiting keyed by actor.
//!
//! Each call to [`KeyedRateLimiter::try_acquire`] holds the lock for its
//! whole check-and-update, so concurrent callers cannot jointly exceed a
//! limit. The clock is injected to keep tests deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Time source for window arithmetic.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_unix(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        // A clock stuck before the epoch reads as zero, which opens the
        // window rather than locking everyone out.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// Limit for one action kind.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Whether the limit applies at all.
    pub enabled: bool,
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitConfig {
    /// Follow operations: 50 per minute per actor.
    #[must_use]
    pub const fn follows() -> Self {
        Self {
            enabled: true,
            max_requests: 50,
            window_secs: 60,
        }
    }

    /// Unfollow operations: 100 per minute per actor.
    #[must_use]
    pub const fn unfollows() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_secs: 60,
        }
    }

    /// Block operations: 20 per minute per actor.
    #[must_use]
    pub const fn blocks() -> Self {
        Self {
            enabled: true,
            max_requests: 20,
            window_secs: 60,
        }
    }

    /// A limiter that never denies. For tests and internal callers.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            enabled: false,
            max_requests: u32::MAX,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    count: u32,
    window_start: u64,
}

/// Per-key fixed-window limiter.
pub struct KeyedRateLimiter {
    records: Mutex<HashMap<String, WindowRecord>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl KeyedRateLimiter {
    /// Limiter on the system clock.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Limiter with an injected clock.
    #[must_use]
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Take one unit of budget for `key`.
    ///
    /// # Errors
    ///
    /// Returns the seconds until the window resets when the budget is
    /// exhausted.
    pub fn try_acquire(&self, key: &str) -> Result<(), u64> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = self.clock.now_unix();
        let mut records = self.records.lock();
        let record = records.entry(key.to_string()).or_insert(WindowRecord {
            count: 0,
            window_start: now,
        });

        if now >= record.window_start.saturating_add(self.config.window_secs) {
            record.window_start = now;
            record.count = 0;
        }

        if record.count >= self.config.max_requests {
            let retry_after = record
                .window_start
                .saturating_add(self.config.window_secs)
                .saturating_sub(now);
            return Err(retry_after.max(1));
        }

        record.count += 1;
        Ok(())
    }

    /// Remaining budget for `key` in the current window.
    #[must_use]
    pub fn remaining(&self, key: &str) -> u32 {
        if !self.config.enabled {
            return u32::MAX;
        }
        let now = self.clock.now_unix();
        let records = self.records.lock();
        match records.get(key) {
            Some(record) if now < record.window_start.saturating_add(self.config.window_secs) => {
                self.config.max_requests.saturating_sub(record.count)
            },
            _ => self.config.max_requests,
        }
    }

    /// Drop records whose window has long passed. Callers run this
    /// opportunistically; correctness never depends on it.
    pub fn prune(&self) {
        let now = self.clock.now_unix();
        let window = self.config.window_secs;
        self.records
            .lock()
            .retain(|_, r| now < r.window_start.saturating_add(window.saturating_mul(2)));
    }
}

impl std::fmt::Debug for KeyedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedRateLimiter")
            .field("config", &self.config)
            .field("tracked_keys", &self.records.lock().len())
            .finish()
    }
}
