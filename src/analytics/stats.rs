use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct LimiterStats {
    pub granted_immediately: AtomicU64,
    pub granted_after_wait: AtomicU64,
    pub rejected: AtomicU64,
    pub waiters_failed: AtomicU64,
    pub timeouts: AtomicU64,
    pub buckets_created: AtomicU64,
    pub buckets_removed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub granted_immediately: u64,
    pub granted_after_wait: u64,
    pub rejected: u64,
    pub waiters_failed: u64,
    pub timeouts: u64,
    pub buckets_created: u64,
    pub buckets_removed: u64,
}

impl LimiterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_granted(&self, waited: bool) {
        if waited {
            self.granted_after_wait.fetch_add(1, Ordering::Relaxed);
        } else {
            self.granted_immediately.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_waiters_failed(&self, n: usize) {
        self.waiters_failed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buckets_created(&self) {
        self.buckets_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_buckets_removed(&self, n: usize) {
        self.buckets_removed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            granted_immediately: self.granted_immediately.load(Ordering::Relaxed),
            granted_after_wait: self.granted_after_wait.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            waiters_failed: self.waiters_failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            buckets_created: self.buckets_created.load(Ordering::Relaxed),
            buckets_removed: self.buckets_removed.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let snapshot = self.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(stats = %json, "Limiter stats"),
            Err(_) => info!("Limiter stats: {:?}", snapshot),
        }
    }
}
