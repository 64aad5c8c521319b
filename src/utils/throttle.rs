//! Log throttling utility
//!
//! Limits how often a repeating event is logged, so a disconnected device
//! does not flood the log with one line per failed read.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Gate that passes at most once per interval
pub struct LogThrottler {
    last_logged: Mutex<Option<Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(None),
            interval,
        }
    }

    /// Create a throttler with the interval given in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if the event should be logged and records the time
    pub fn should_log(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_logged.lock().unwrap();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_event_passes() {
        let throttler = LogThrottler::with_secs(60);
        assert!(throttler.should_log());
        assert!(!throttler.should_log());
    }

    #[test]
    fn test_passes_again_after_interval() {
        let throttler = LogThrottler::new(Duration::from_millis(0));
        assert!(throttler.should_log());
        assert!(throttler.should_log());
    }
}
