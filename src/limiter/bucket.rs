use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{LimiterError, Result};

/// State of a bucket right after a permit was handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Permit {
    /// Tokens left in the window after this acquisition.
    pub remaining: u32,
    /// Clock time (ms) at which the current window ends.
    pub reset: u64,
}

type Waiter = oneshot::Sender<Result<Permit>>;

/// Outcome of a single admission attempt.
#[derive(Debug)]
pub enum Admission {
    Granted(Permit),
    Queued(oneshot::Receiver<Result<Permit>>),
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: u64,
    last_access: u64,
    queue: VecDeque<Waiter>,
    closed: Option<LimiterError>,
}

/// Fixed-window token bucket with a FIFO queue of suspended callers.
///
/// Every field is guarded by one mutex. Refill, the waiter drain that follows
/// it, enqueueing and closing all run under that lock, so a grant can never
/// race a new waiter into the queue.
#[derive(Debug)]
pub struct Bucket {
    limit: u32,
    window_ms: u64,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// A new bucket starts full with its window anchored at `now`.
    pub fn new(limit: u32, window_ms: u64, now: u64) -> Self {
        Self {
            limit,
            window_ms,
            state: Mutex::new(BucketState {
                tokens: limit,
                last_refill: now,
                last_access: now,
                queue: VecDeque::new(),
                closed: None,
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Credits whole elapsed windows and hands the new tokens to queued
    /// waiters, oldest first. Returns how many waiters were released.
    pub fn refill(&self, now: u64) -> usize {
        let mut state = self.state.lock();
        self.refill_locked(&mut state, now)
    }

    fn refill_locked(&self, state: &mut BucketState, now: u64) -> usize {
        let elapsed = now.saturating_sub(state.last_refill);
        let windows = elapsed / self.window_ms;
        if windows == 0 {
            return 0;
        }

        // The partial window left over is dropped, not carried.
        let credit = windows.saturating_mul(self.limit as u64);
        let tokens = (state.tokens as u64).saturating_add(credit);
        state.tokens = tokens.min(self.limit as u64) as u32;
        state.last_refill = now;

        self.drain_locked(state)
    }

    /// Hands available tokens to queued waiters, oldest first.
    fn drain_locked(&self, state: &mut BucketState) -> usize {
        let reset = state.last_refill.saturating_add(self.window_ms);
        let mut released = 0;
        while state.tokens > 0 {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            let permit = Permit {
                remaining: state.tokens - 1,
                reset,
            };
            // A waiter whose caller gave up is skipped and keeps its token in the bucket.
            if waiter.send(Ok(permit)).is_ok() {
                state.tokens -= 1;
                released += 1;
            }
        }

        if released > 0 {
            trace!(released, tokens = state.tokens, "Released queued waiters");
        }
        released
    }

    /// Puts back a token that was granted to a caller who stopped waiting,
    /// passing it on to the next waiter if there is one.
    fn refund(&self) {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return;
        }
        state.tokens = state.tokens.saturating_add(1).min(self.limit);
        let released = self.drain_locked(&mut state);
        debug!(released, tokens = state.tokens, "Refunded abandoned grant");
    }

    /// Refills, then either takes a token or enqueues the caller.
    pub fn admit(&self, now: u64) -> Result<Admission> {
        let mut state = self.state.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }

        state.last_access = now;
        self.refill_locked(&mut state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            return Ok(Admission::Granted(Permit {
                remaining: state.tokens,
                reset: state.last_refill.saturating_add(self.window_ms),
            }));
        }

        let (tx, rx) = oneshot::channel();
        state.queue.push_back(tx);
        debug!(queued = state.queue.len(), "Bucket exhausted, caller queued");
        Ok(Admission::Queued(rx))
    }

    /// Non-suspending admission. `Ok(None)` when the bucket is exhausted.
    pub fn try_take(&self, now: u64) -> Result<Option<Permit>> {
        let mut state = self.state.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }

        state.last_access = now;
        self.refill_locked(&mut state, now);

        if state.tokens == 0 {
            return Ok(None);
        }
        state.tokens -= 1;
        Ok(Some(Permit {
            remaining: state.tokens,
            reset: state.last_refill.saturating_add(self.window_ms),
        }))
    }

    /// Takes a token, suspending until a later refill grants one.
    pub async fn acquire(&self, now: u64) -> Result<Permit> {
        match self.admit(now)? {
            Admission::Granted(permit) => Ok(permit),
            Admission::Queued(rx) => self.wait(rx).await,
        }
    }

    /// Awaits a grant from a queued admission on this bucket.
    ///
    /// If the future is dropped after a refill already granted the token but
    /// before it was claimed, the token goes back to the bucket.
    pub async fn wait(&self, rx: oneshot::Receiver<Result<Permit>>) -> Result<Permit> {
        let mut pending = PendingGrant {
            bucket: self,
            rx,
            settled: false,
        };
        let result = (&mut pending.rx).await;
        pending.settled = true;
        // The sender only disappears without a message if the bucket itself was dropped.
        result.unwrap_or(Err(LimiterError::Shutdown))
    }

    /// Refills as a side effect (which may release waiters), then reports tokens.
    pub fn remaining(&self, now: u64) -> u32 {
        let mut state = self.state.lock();
        state.last_access = now;
        self.refill_locked(&mut state, now);
        state.tokens
    }

    pub fn reset_time(&self) -> u64 {
        self.state.lock().last_refill.saturating_add(self.window_ms)
    }

    /// Waiters still queued whose caller has not given up.
    pub fn waiting(&self) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    /// Fails every queued waiter with `err` and rejects later admissions.
    /// Returns how many live waiters were failed.
    pub fn close(&self, err: LimiterError) -> usize {
        let mut state = self.state.lock();
        let mut failed = 0;
        for waiter in state.queue.drain(..) {
            if waiter.send(Err(err.clone())).is_ok() {
                failed += 1;
            }
        }
        state.closed = Some(err);
        failed
    }

    /// Closes the bucket if nothing is waiting, it would be full after refill
    /// and it has not been touched for `idle_for_ms`. Checked and closed under
    /// one lock so no caller can slip in between.
    pub fn close_if_idle(&self, now: u64, idle_for_ms: u64, err: LimiterError) -> bool {
        let mut state = self.state.lock();
        self.refill_locked(&mut state, now);
        state.queue.retain(|w| !w.is_closed());

        let idle = state.queue.is_empty()
            && state.tokens == self.limit
            && now.saturating_sub(state.last_access) >= idle_for_ms;
        if idle {
            state.closed = Some(err);
        }
        idle
    }
}

struct PendingGrant<'a> {
    bucket: &'a Bucket,
    rx: oneshot::Receiver<Result<Permit>>,
    settled: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // After close() no grant can arrive, so at most one is still in the channel.
        self.rx.close();
        if let Ok(Ok(_)) = self.rx.try_recv() {
            self.bucket.refund();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn granted(admission: Admission) -> Permit {
        match admission {
            Admission::Granted(permit) => permit,
            Admission::Queued(_) => panic!("expected an immediate grant"),
        }
    }

    fn queued(admission: Admission) -> oneshot::Receiver<Result<Permit>> {
        match admission {
            Admission::Queued(rx) => rx,
            Admission::Granted(p) => panic!("expected to be queued, got {:?}", p),
        }
    }

    #[test]
    fn test_grants_never_exceed_limit_within_window() {
        let bucket = Bucket::new(5, 1000, 0);

        for expected in (0..5).rev() {
            let permit = bucket.try_take(10).unwrap().unwrap();
            assert_eq!(permit.remaining, expected);
            assert_eq!(permit.reset, 1000);
        }

        assert_eq!(bucket.try_take(500).unwrap(), None);
        assert_eq!(bucket.try_take(999).unwrap(), None);
    }

    #[test]
    fn test_refill_on_window_boundary() {
        let bucket = Bucket::new(5, 1000, 0);
        for _ in 0..5 {
            granted(bucket.admit(0).unwrap());
        }

        let _pending = queued(bucket.admit(999).unwrap());
        assert_eq!(bucket.remaining(999), 0);

        // The pending waiter takes the first token of the new window.
        assert_eq!(bucket.refill(1000), 1);
        assert_eq!(bucket.remaining(1000), 4);
        assert_eq!(bucket.reset_time(), 2000);
    }

    #[test]
    fn test_refill_at_boundary_without_waiters() {
        let bucket = Bucket::new(5, 1000, 0);
        for _ in 0..5 {
            granted(bucket.admit(0).unwrap());
        }

        let permit = granted(bucket.admit(1000).unwrap());
        assert_eq!(permit.remaining, 4);
        assert_eq!(permit.reset, 2000);
    }

    #[test]
    fn test_refill_is_idempotent_within_window() {
        let bucket = Bucket::new(3, 1000, 0);
        for _ in 0..3 {
            bucket.try_take(0).unwrap();
        }

        assert_eq!(bucket.refill(1500), 0);
        assert_eq!(bucket.remaining(1500), 3);
        bucket.try_take(1500).unwrap();

        // Same window as the last refill: nothing is credited again.
        assert_eq!(bucket.remaining(1999), 2);
        assert_eq!(bucket.remaining(2499), 2);
        // The 500ms remainder was dropped, so the next credit is at 2500.
        assert_eq!(bucket.remaining(2500), 3);
    }

    #[test]
    fn test_refill_caps_at_limit() {
        let bucket = Bucket::new(4, 100, 0);
        bucket.try_take(0).unwrap();

        assert_eq!(bucket.remaining(u64::MAX / 2), 4);
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let bucket = Bucket::new(2, 100, 1_000);
        bucket.try_take(1_000).unwrap();
        bucket.try_take(1_000).unwrap();

        assert_eq!(bucket.remaining(10), 0);
        assert_eq!(bucket.reset_time(), 1_100);
    }

    #[test]
    fn test_waiters_released_in_fifo_order() {
        let bucket = Bucket::new(1, 100, 0);
        granted(bucket.admit(0).unwrap());

        let mut a = queued(bucket.admit(1).unwrap());
        let mut b = queued(bucket.admit(2).unwrap());
        let mut c = queued(bucket.admit(3).unwrap());
        assert_eq!(bucket.waiting(), 3);

        assert_eq!(bucket.refill(100), 1);
        assert!(a.try_recv().unwrap().is_ok());
        assert!(b.try_recv().is_err());
        assert!(c.try_recv().is_err());

        assert_eq!(bucket.refill(200), 1);
        assert!(b.try_recv().unwrap().is_ok());
        assert!(c.try_recv().is_err());

        assert_eq!(bucket.refill(300), 1);
        assert!(c.try_recv().unwrap().is_ok());
        assert_eq!(bucket.waiting(), 0);
    }

    #[test]
    fn test_released_waiter_receives_post_grant_state() {
        let bucket = Bucket::new(3, 100, 0);
        for _ in 0..3 {
            bucket.try_take(0).unwrap();
        }
        let mut rx = queued(bucket.admit(50).unwrap());

        bucket.refill(120);
        let permit = rx.try_recv().unwrap().unwrap();
        assert_eq!(permit, Permit { remaining: 2, reset: 220 });
        assert_eq!(bucket.remaining(120), 2);
    }

    #[test]
    fn test_abandoned_waiter_does_not_consume_token() {
        let bucket = Bucket::new(1, 100, 0);
        bucket.try_take(0).unwrap();

        let abandoned = queued(bucket.admit(10).unwrap());
        let mut live = queued(bucket.admit(20).unwrap());
        drop(abandoned);
        assert_eq!(bucket.waiting(), 1);

        assert_eq!(bucket.refill(100), 1);
        assert!(live.try_recv().unwrap().is_ok());
        assert_eq!(bucket.remaining(100), 0);
    }

    #[test]
    fn test_close_fails_waiters_and_later_admissions() {
        let bucket = Bucket::new(1, 100, 0);
        bucket.try_take(0).unwrap();
        let mut rx = queued(bucket.admit(0).unwrap());

        let err = LimiterError::Removed { key: "k".into() };
        assert_eq!(bucket.close(err.clone()), 1);
        assert_eq!(rx.try_recv().unwrap(), Err(err.clone()));
        assert_eq!(bucket.admit(500).unwrap_err(), err);
        assert_eq!(bucket.try_take(500).unwrap_err(), err);
    }

    #[test]
    fn test_close_if_idle_requires_full_bucket_and_quiet_period() {
        let err = LimiterError::Removed { key: "k".into() };
        let bucket = Bucket::new(2, 100, 0);
        assert!(!bucket.close_if_idle(50, 100, err.clone()));

        bucket.try_take(150).unwrap();
        // Window restarted at 150, so the spent token only comes back at 250.
        assert!(!bucket.close_if_idle(200, 50, err.clone()));

        bucket.try_take(260).unwrap();
        bucket.try_take(260).unwrap();
        let _rx = queued(bucket.admit(260).unwrap());
        assert!(!bucket.close_if_idle(300, 0, err.clone()));
        drop(_rx);

        // The abandoned waiter is pruned; the bucket refills at 360.
        assert!(bucket.close_if_idle(460, 100, err.clone()));
        assert_eq!(bucket.try_take(460).unwrap_err(), err);
    }

    #[test]
    fn test_huge_window_saturates_reset() {
        let start = 1_700_000_000_000;
        let bucket = Bucket::new(1, u64::MAX, start);

        let permit = bucket.try_take(start).unwrap().unwrap();
        assert_eq!(permit, Permit { remaining: 0, reset: u64::MAX });
        assert_eq!(bucket.reset_time(), u64::MAX);
        assert_eq!(bucket.try_take(u64::MAX).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unclaimed_grant_is_refunded_to_next_waiter() {
        let bucket = Bucket::new(1, 100, 0);
        bucket.try_take(0).unwrap();
        let first = queued(bucket.admit(0).unwrap());
        let mut second = queued(bucket.admit(0).unwrap());

        {
            let wait = bucket.wait(first);
            tokio::pin!(wait);
            assert!(futures_util::poll!(wait.as_mut()).is_pending());

            // Granted to the first caller, who then stops waiting without claiming it.
            assert_eq!(bucket.refill(100), 1);
        }

        assert!(second.try_recv().unwrap().is_ok());
        assert_eq!(bucket.remaining(100), 0);
    }

    #[tokio::test]
    async fn test_unclaimed_grant_returns_to_bucket() {
        let bucket = Bucket::new(2, 100, 0);
        bucket.try_take(0).unwrap();
        bucket.try_take(0).unwrap();
        let rx = queued(bucket.admit(0).unwrap());

        {
            let wait = bucket.wait(rx);
            tokio::pin!(wait);
            assert!(futures_util::poll!(wait.as_mut()).is_pending());
            bucket.refill(100);
            assert_eq!(bucket.remaining(100), 1);
        }

        assert_eq!(bucket.remaining(100), 2);
    }

    #[tokio::test]
    async fn test_acquire_suspends_until_refill() {
        let bucket = std::sync::Arc::new(Bucket::new(1, 1000, 0));
        bucket.acquire(0).await.unwrap();

        let blocked = timeout(Duration::from_millis(20), bucket.acquire(999)).await;
        assert!(blocked.is_err());

        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire(999).await })
        };
        while bucket.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        // The earlier, timed-out waiter is skipped; the spawned one gets the token.
        assert_eq!(bucket.refill(1000), 1);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(permit, Permit { remaining: 0, reset: 2000 });
    }
}
