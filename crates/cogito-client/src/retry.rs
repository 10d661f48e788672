use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cogito_core::{CogitoError, CogitoResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// How many times to call the vendor and how long to back off between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn start(&self) -> RetryContext {
        RetryContext {
            attempt: 0,
            policy: *self,
        }
    }
}

/// Attempt counter for one logical request.
#[derive(Debug, Clone)]
pub struct RetryContext {
    attempt: u32,
    policy: RetryPolicy,
}

impl RetryContext {
    /// Mark the start of the next call and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.policy.max_attempts.max(1)
    }

    /// Delay after the current failed attempt: `base * 2^(attempt - 1)`.
    pub fn delay(&self) -> Duration {
        let exponent = self.attempt.saturating_sub(1).min(31);
        self.policy
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
    }
}

/// Shared flag that interrupts backoff waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block for up to `timeout`. Returns true if cancelled before or during
    /// the wait.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Backoff wait between attempts. Swapped out in tests to record delays
/// without sleeping.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration, cancel: &CancelToken) -> CogitoResult<()>;
}

/// Real waits that end early when the token is cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenSleeper;

impl Sleeper for TokenSleeper {
    fn sleep(&self, delay: Duration, cancel: &CancelToken) -> CogitoResult<()> {
        if cancel.wait(delay) {
            Err(CogitoError::Cancelled)
        } else {
            Ok(())
        }
    }
}
