//! Log throttling utility
//!
//! Limits how often the same log key is recorded so that a device stuck in a
//! timeout or dequeue-error loop does not flood the log. Suppressed repeats are
//! counted and reported the next time the key is allowed through.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key log rate limiter
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler that lets each key through at most once per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether `key` may be logged now.
    ///
    /// Returns `Some(suppressed)` with the number of repeats swallowed since the
    /// last time the key was logged, or `None` if this occurrence is throttled.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed = state.suppressed.saturating_add(1);
                None
            }
            Some(state) => {
                let suppressed = std::mem::take(&mut state.suppressed);
                state.last_logged = now;
                Some(suppressed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Check if a message should be logged (not throttled)
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key so the next occurrence logs immediately (call on recovery)
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled warning with suppressed-repeat count
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled error with suppressed-repeat count
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::error!(suppressed, $($arg)*);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_logs() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.check("dqbuf"), Some(0));
    }

    #[test]
    fn test_suppressed_count_reported() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.check("timeout"), Some(0));
        assert_eq!(throttler.check("timeout"), None);
        assert_eq!(throttler.check("timeout"), None);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.check("timeout"), Some(2));
        assert_eq!(throttler.check("timeout"), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("k"));
        assert!(!throttler.should_log("k"));
        throttler.clear("k");
        assert!(throttler.should_log("k"));
    }

    #[test]
    fn test_macros_compile_and_throttle() {
        let throttler = LogThrottler::default();
        warn_throttled!(throttler, "w", "warning {}", 1);
        error_throttled!(throttler, "e", "error {}", 2);
        assert!(!throttler.is_empty());
        assert!(!throttler.should_log("w"));
    }
}
