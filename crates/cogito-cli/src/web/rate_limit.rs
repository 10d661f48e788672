use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-window request counter keyed by an arbitrary string
/// (client address plus path).
pub struct RateLimiter {
    window: Duration,
    max: u32,
    windows: Mutex<HashMap<String, Window>>,
}

struct Window {
    started: Instant,
    hits: u32,
}

/// A rejected request and how long until its window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limited {
    pub retry_after: Duration,
}

impl Limited {
    /// Seconds until reset, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.retry_after.as_millis() as u64;
        millis.div_ceil(1000)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), Limited> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), Limited> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        // drop windows that have closed so idle clients do not accumulate
        windows.retain(|_, w| now.duration_since(w.started) < self.window);

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            hits: 0,
        });
        if window.hits >= self.max {
            let elapsed = now.duration_since(window.started);
            return Err(Limited {
                retry_after: self.window.saturating_sub(elapsed),
            });
        }
        window.hits += 1;
        Ok(())
    }
}
