use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::analytics::stats::LimiterStats;
use crate::config::validate_limit;
use crate::error::{LimiterError, Result};
use crate::limiter::bucket::{Admission, Bucket, Permit};

/// Registry of per-key buckets, created lazily on first use.
///
/// The parameters a key is first seen with stick for the bucket's lifetime.
/// Later calls passing a different limit or window reuse the existing bucket.
#[derive(Debug)]
pub struct KeyedLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    default_limit: u32,
    default_window_ms: u64,
    stats: Arc<LimiterStats>,
}

impl KeyedLimiter {
    pub fn new(
        default_limit: u32,
        default_window_ms: u64,
        stats: Arc<LimiterStats>,
    ) -> Result<Self> {
        validate_limit(default_limit, default_window_ms)?;
        Ok(Self {
            buckets: DashMap::new(),
            default_limit,
            default_window_ms,
            stats,
        })
    }

    /// Bucket for `key`, created with the given (or default) parameters if unseen.
    pub fn bucket(
        &self,
        key: &str,
        limit: Option<u32>,
        window_ms: Option<u64>,
        now: u64,
    ) -> Result<Arc<Bucket>> {
        let limit = limit.unwrap_or(self.default_limit);
        let window_ms = window_ms.unwrap_or(self.default_window_ms);
        validate_limit(limit, window_ms)?;

        if let Some(bucket) = self.buckets.get(key) {
            return Ok(bucket.value().clone());
        }

        let bucket = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                debug!(key, limit, window_ms, "Creating bucket");
                self.stats.inc_buckets_created();
                v.insert(Arc::new(Bucket::new(limit, window_ms, now))).value().clone()
            }
        };
        Ok(bucket)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(key).map(|b| b.value().clone())
    }

    /// Admission against the key's bucket. A bucket that was removed between
    /// lookup and admission is replaced by a fresh one. The bucket is returned
    /// so a queued caller can wait on it.
    pub fn admit(
        &self,
        key: &str,
        limit: Option<u32>,
        window_ms: Option<u64>,
        now: u64,
    ) -> Result<(Arc<Bucket>, Admission)> {
        loop {
            let bucket = self.bucket(key, limit, window_ms, now)?;
            match bucket.admit(now) {
                Err(LimiterError::Removed { .. }) => continue,
                Err(e) => return Err(e),
                Ok(admission) => return Ok((bucket, admission)),
            }
        }
    }

    pub fn try_acquire(
        &self,
        key: &str,
        limit: Option<u32>,
        window_ms: Option<u64>,
        now: u64,
    ) -> Result<Option<Permit>> {
        loop {
            let bucket = self.bucket(key, limit, window_ms, now)?;
            match bucket.try_take(now) {
                Err(LimiterError::Removed { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Tokens left for `key`. Refills as a side effect, so queued waiters may
    /// be released. Unknown keys report the default limit without creating a bucket.
    pub fn remaining(&self, key: &str, now: u64) -> u32 {
        match self.get(key) {
            Some(bucket) => bucket.remaining(now),
            None => self.default_limit,
        }
    }

    /// End of the key's current window, or `now` when no bucket exists.
    pub fn reset_time(&self, key: &str, now: u64) -> u64 {
        match self.get(key) {
            Some(bucket) => bucket.reset_time(),
            None => now,
        }
    }

    /// Drops the bucket for `key` and fails its waiters. Returns how many
    /// waiters were failed, or `None` if the key had no bucket.
    pub fn remove(&self, key: &str) -> Option<usize> {
        let (key, bucket) = self.buckets.remove(key)?;
        let failed = bucket.close(LimiterError::Removed { key: key.clone() });
        self.stats.add_buckets_removed(1);
        self.stats.add_waiters_failed(failed);
        debug!(key = %key, failed, "Removed bucket");
        Some(failed)
    }

    /// Drops every bucket, failing waiters with `Removed`.
    pub fn clear(&self) -> usize {
        self.drain_with(|key| LimiterError::Removed { key: key.to_string() })
    }

    /// Drops every bucket, failing waiters with `err`.
    pub fn close_all(&self, err: LimiterError) -> usize {
        self.drain_with(|_| err.clone())
    }

    fn drain_with<F>(&self, make_err: F) -> usize
    where
        F: Fn(&str) -> LimiterError,
    {
        let mut removed = 0;
        let mut failed = 0;
        self.buckets.retain(|key, bucket| {
            failed += bucket.close(make_err(key));
            removed += 1;
            false
        });
        self.stats.add_buckets_removed(removed);
        self.stats.add_waiters_failed(failed);
        if removed > 0 {
            info!(removed, failed, "Cleared all buckets");
        }
        failed
    }

    /// Evicts buckets that are full, have no waiters and were not touched
    /// for `idle_for_ms`. Returns how many were evicted.
    pub fn reap_idle(&self, now: u64, idle_for_ms: u64) -> usize {
        let mut reaped = 0;
        self.buckets.retain(|key, bucket| {
            let err = LimiterError::Removed { key: key.clone() };
            let idle = bucket.close_if_idle(now, idle_for_ms, err);
            if idle {
                reaped += 1;
            }
            !idle
        });
        if reaped > 0 {
            self.stats.add_buckets_removed(reaped);
            debug!(reaped, remaining = self.buckets.len(), "Reaped idle buckets");
        }
        reaped
    }

    /// Refills every bucket. Returns the number of waiters released.
    pub fn tick(&self, now: u64) -> usize {
        self.buckets.iter().map(|entry| entry.value().refill(now)).sum()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
