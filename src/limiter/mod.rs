//! Two-level rate limiting: an optional global gate shared by every caller,
//! then a token bucket per key.
//!
//! Buckets refill in whole windows only and only when touched (`acquire`,
//! `remaining_tokens`, `tick`). With `RefillMode::Lazy`, callers queued on a
//! key that never sees another access stay queued; `RefillMode::Ticking` runs a
//! background task that refills every bucket on an interval instead.

pub mod bucket;
pub mod global;
pub mod keyed;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analytics::stats::{LimiterStats, StatsSnapshot};
use crate::config::{validate_limit, LimiterConfig, RefillMode};
use crate::error::{LimiterError, Result};
use crate::utils::time::{Clock, SystemClock};

pub use bucket::{Admission, Bucket, Permit};
pub use global::GlobalLimiter;
pub use keyed::KeyedLimiter;

#[derive(Debug)]
pub struct RateLimiter {
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    global: Option<GlobalLimiter>,
    keyed: KeyedLimiter,
    stats: Arc<LimiterStats>,
    shut_down: AtomicBool,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let now = clock.now_ms();
        let stats = Arc::new(LimiterStats::new());
        let global = config
            .global()
            .map(|(limit, window_ms)| GlobalLimiter::new(limit, window_ms, now))
            .transpose()?;
        let keyed = KeyedLimiter::new(config.limit, config.window_ms, stats.clone())?;

        info!(
            limit = config.limit,
            window_ms = config.window_ms,
            global = ?config.global(),
            refill_mode = ?config.refill_mode,
            "Rate limiter initialized"
        );

        Ok(Self {
            config,
            clock,
            global,
            keyed,
            stats,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Waits for a permit on `key` using the default limit and window.
    pub async fn acquire(&self, key: &str) -> Result<Permit> {
        self.acquire_with(key, None, None).await
    }

    /// Waits for a permit on `key`. `limit`/`window_ms` only apply if this
    /// call creates the bucket.
    ///
    /// The global gate is passed first; the caller may therefore queue twice.
    pub async fn acquire_with(
        &self,
        key: &str,
        limit: Option<u32>,
        window_ms: Option<u64>,
    ) -> Result<Permit> {
        self.ensure_running()?;
        validate_limit(
            limit.unwrap_or(self.config.limit),
            window_ms.unwrap_or(self.config.window_ms),
        )?;

        let mut waited = false;

        if let Some(global) = &self.global {
            if let Admission::Queued(rx) = global.admit(self.clock.now_ms())? {
                waited = true;
                global.wait(rx).await?;
            }
        }

        let (bucket, admission) = self.admit_key(key, limit, window_ms)?;
        let permit = match admission {
            Admission::Granted(permit) => permit,
            Admission::Queued(rx) => {
                waited = true;
                bucket.wait(rx).await?
            }
        };

        self.stats.inc_granted(waited);
        debug!(key, remaining = permit.remaining, reset = permit.reset, waited, "Permit granted");
        Ok(permit)
    }

    /// Per-key admission step. A shutdown that raced past `ensure_running`
    /// may have drained the registry before this call created a bucket, so
    /// the flag is checked again once the bucket is in the registry.
    fn admit_key(
        &self,
        key: &str,
        limit: Option<u32>,
        window_ms: Option<u64>,
    ) -> Result<(Arc<Bucket>, Admission)> {
        let admitted = self.keyed.admit(key, limit, window_ms, self.clock.now_ms())?;
        if self.is_shut_down() {
            self.keyed.close_all(LimiterError::Shutdown);
            return Err(LimiterError::Shutdown);
        }
        Ok(admitted)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`. An
    /// abandoned place in a queue is skipped by later refills, and a token
    /// granted just as the deadline fired goes back to its bucket. A global
    /// token already taken before the per-key wait timed out is not returned.
    pub async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<Permit> {
        match tokio::time::timeout(timeout, self.acquire(key)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.inc_timeouts();
                warn!(key, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for permit");
                Err(LimiterError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Non-suspending acquire. `Ok(None)` if either level is exhausted; a
    /// global token taken before the key turned out to be exhausted is spent.
    pub fn try_acquire(&self, key: &str) -> Result<Option<Permit>> {
        self.ensure_running()?;
        let now = self.clock.now_ms();

        if let Some(global) = &self.global {
            if global.try_acquire(now)?.is_none() {
                self.stats.inc_rejected();
                return Ok(None);
            }
        }

        let permit = self.keyed.try_acquire(key, None, None, now)?;
        match permit {
            Some(_) => self.stats.inc_granted(false),
            None => self.stats.inc_rejected(),
        }
        Ok(permit)
    }

    /// Removes the bucket for `key`. Callers queued on it fail with
    /// [`LimiterError::Removed`]; the next acquire starts a fresh bucket.
    pub fn remove_limit(&self, key: &str) {
        self.keyed.remove(key);
    }

    pub fn clear_limits(&self) {
        self.keyed.clear();
    }

    /// Not read-only: refills the bucket first, which can release waiters.
    pub fn remaining_tokens(&self, key: &str) -> u32 {
        self.keyed.remaining(key, self.clock.now_ms())
    }

    /// End of the key's current window. A key without a bucket reports "now";
    /// use [`remaining_tokens`](Self::remaining_tokens) to check availability.
    pub fn reset_time(&self, key: &str) -> u64 {
        self.keyed.reset_time(key, self.clock.now_ms())
    }

    /// Tokens left in the global gate, if one is configured. Refills as a side effect.
    pub fn global_remaining(&self) -> Option<u32> {
        let now = self.clock.now_ms();
        self.global.as_ref().map(|g| g.remaining(now))
    }

    /// Live waiters queued on `key`.
    pub fn waiting(&self, key: &str) -> usize {
        self.keyed.get(key).map(|b| b.waiting()).unwrap_or(0)
    }

    pub fn global_waiting(&self) -> usize {
        self.global.as_ref().map(|g| g.waiting()).unwrap_or(0)
    }

    /// Refills the global gate and every keyed bucket.
    pub fn tick(&self) -> usize {
        let now = self.clock.now_ms();
        let global = self.global.as_ref().map(|g| g.tick(now)).unwrap_or(0);
        global + self.keyed.tick(now)
    }

    /// Evicts keyed buckets that are full, have no waiters and have not been
    /// used for `idle_for`.
    pub fn reap_idle(&self, idle_for: Duration) -> usize {
        self.keyed.reap_idle(self.clock.now_ms(), idle_for.as_millis() as u64)
    }

    pub fn len(&self) -> usize {
        self.keyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyed.is_empty()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn log_stats(&self) {
        self.stats.log_stats();
    }

    /// Fails every pending acquire with [`LimiterError::Shutdown`] and rejects
    /// all later ones.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut failed = self.global.as_ref().map(|g| g.shutdown()).unwrap_or(0);
        self.stats.add_waiters_failed(failed);
        failed += self.keyed.close_all(LimiterError::Shutdown);
        info!(failed, "Rate limiter shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(LimiterError::Shutdown);
        }
        Ok(())
    }

    /// Starts the refill ticker (ticking mode) and the idle reaper (when
    /// `idle_ttl_ms` is set). Tasks hold a weak reference and stop once the
    /// limiter is dropped or shut down.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.refill_mode == RefillMode::Ticking {
            let period = Duration::from_millis(self.config.tick_interval_ms);
            handles.push(spawn_periodic(Arc::downgrade(self), period, |limiter| {
                let released = limiter.tick();
                if released > 0 {
                    debug!(released, "Ticker released waiters");
                }
            }));
            info!(interval_ms = self.config.tick_interval_ms, "Background refill ticker started");
        }

        if let Some(ttl_ms) = self.config.idle_ttl_ms {
            let period = Duration::from_millis(self.config.reap_interval_ms);
            let idle_for = Duration::from_millis(ttl_ms);
            handles.push(spawn_periodic(Arc::downgrade(self), period, move |limiter| {
                limiter.reap_idle(idle_for);
            }));
            info!(ttl_ms, interval_ms = self.config.reap_interval_ms, "Idle bucket reaper started");
        }

        handles
    }
}

fn spawn_periodic<F>(limiter: Weak<RateLimiter>, period: Duration, task: F) -> JoinHandle<()>
where
    F: Fn(&RateLimiter) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(limiter) = limiter.upgrade() else {
                break;
            };
            if limiter.is_shut_down() {
                break;
            }
            task(&limiter);
        }
    })
}
