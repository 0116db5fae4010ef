use tokio::sync::oneshot;
use tracing::debug;

use crate::config::validate_limit;
use crate::error::{LimiterError, Result};
use crate::limiter::bucket::{Admission, Bucket, Permit};

/// Aggregate ceiling shared by every key. Built once with the limiter.
#[derive(Debug)]
pub struct GlobalLimiter {
    bucket: Bucket,
}

impl GlobalLimiter {
    pub fn new(limit: u32, window_ms: u64, now: u64) -> Result<Self> {
        validate_limit(limit, window_ms)?;
        Ok(Self {
            bucket: Bucket::new(limit, window_ms, now),
        })
    }

    /// Passes the global gate, suspending while the shared bucket is empty.
    pub fn admit(&self, now: u64) -> Result<Admission> {
        let admission = self.bucket.admit(now)?;
        if let Admission::Queued(_) = &admission {
            debug!(limit = self.bucket.limit(), "Global limit reached, caller queued");
        }
        Ok(admission)
    }

    /// Waits for a queued admission to be granted.
    pub async fn wait(&self, rx: oneshot::Receiver<Result<Permit>>) -> Result<Permit> {
        self.bucket.wait(rx).await
    }

    pub fn try_acquire(&self, now: u64) -> Result<Option<Permit>> {
        self.bucket.try_take(now)
    }

    pub fn remaining(&self, now: u64) -> u32 {
        self.bucket.remaining(now)
    }

    pub fn waiting(&self) -> usize {
        self.bucket.waiting()
    }

    pub fn tick(&self, now: u64) -> usize {
        self.bucket.refill(now)
    }

    pub fn shutdown(&self) -> usize {
        self.bucket.close(LimiterError::Shutdown)
    }
}
