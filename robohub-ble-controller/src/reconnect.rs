//! Bounded reconnection with exponential backoff
//!
//! Only an unexpected link loss starts a supervisor loop. A manual
//! disconnect, or a fresh `connect()`, stops it at the next attempt boundary
//! and cuts any backoff sleep short.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// `min(max_delay, base_delay * 2^attempt)`, no jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Shared between a session and its supervisor loop
#[derive(Debug, Default)]
pub struct RetryState {
    attempt: AtomicU32,
    manual_disconnect: AtomicBool,
    running: AtomicBool,
    epoch: AtomicU64,
    cancel: Notify,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub fn is_manual(&self) -> bool {
        self.manual_disconnect.load(Ordering::SeqCst)
    }

    /// Flag an intentional teardown and wake a sleeping supervisor
    pub fn set_manual(&self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    /// Fresh `connect()`: clear the flag and counter, and retire any loop
    /// started for an earlier connection
    pub fn restart(&self) -> u64 {
        self.manual_disconnect.store(false, Ordering::SeqCst);
        self.attempt.store(0, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel.notify_waiters();
        epoch
    }

    /// Successful connection
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the single supervisor slot. `false` if a loop is already active.
    pub fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn should_stop(&self, epoch: u64) -> bool {
        self.is_manual() || self.epoch() != epoch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reconnected,
    /// Manual disconnect or a newer `connect()`
    Cancelled,
    Exhausted,
}

/// Run the retry loop. `attempt(i)` performs one physical reconnect and
/// reports whether the link is up afterwards.
pub async fn supervise<F, Fut>(
    policy: &ReconnectPolicy,
    retry: &RetryState,
    epoch: u64,
    mut attempt: F,
) -> Outcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for i in 0..policy.max_retries {
        if retry.should_stop(epoch) {
            return Outcome::Cancelled;
        }
        retry.attempt.store(i, Ordering::SeqCst);

        let connected = attempt(i).await;
        if retry.should_stop(epoch) {
            return Outcome::Cancelled;
        }
        if connected {
            return Outcome::Reconnected;
        }

        let delay = policy.delay(i);
        tracing::debug!(attempt = i, delay_ms = delay.as_millis() as u64, "reconnect failed, backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = retry.cancel.notified() => {
                if retry.should_stop(epoch) {
                    return Outcome::Cancelled;
                }
            }
        }
    }
    Outcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn delays_double_and_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7).map(|i| policy.delay(i).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(policy.delay(64), Duration::from_millis(30_000));
    }

    #[test]
    fn single_loop_slot() {
        let retry = RetryState::new();
        assert!(retry.try_begin());
        assert!(!retry.try_begin());
        retry.finish();
        assert!(retry.try_begin());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_exact_delays() {
        let retry = RetryState::new();
        let epoch = retry.restart();
        let start = Instant::now();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let outcome = supervise(&ReconnectPolicy::default(), &retry, epoch, |_| {
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push(start.elapsed().as_millis() as u64);
                false
            }
        })
        .await;

        assert_eq!(outcome, Outcome::Exhausted);
        assert_eq!(*calls.lock().unwrap(), vec![0, 1000, 3000]);
        assert_eq!(start.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_attempt() {
        let retry = RetryState::new();
        let epoch = retry.restart();
        let outcome = supervise(&ReconnectPolicy::default(), &retry, epoch, |i| async move { i == 1 }).await;
        assert_eq!(outcome, Outcome::Reconnected);
        assert_eq!(retry.attempt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_flag_cuts_sleep_short() {
        let retry = Arc::new(RetryState::new());
        let epoch = retry.restart();
        let calls = Arc::new(Mutex::new(0u32));

        let task = {
            let retry = retry.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                supervise(&ReconnectPolicy::default(), &retry, epoch, |_| {
                    let calls = calls.clone();
                    async move {
                        *calls.lock().unwrap() += 1;
                        false
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        retry.set_manual();
        assert_eq!(task.await.unwrap(), Outcome::Cancelled);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_epoch_retires_loop() {
        let retry = RetryState::new();
        let epoch = retry.restart();
        retry.restart();
        let outcome = supervise(&ReconnectPolicy::default(), &retry, epoch, |_| async { true }).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(!retry.is_manual());
    }
}
