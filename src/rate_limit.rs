//! Per-client request throttling.
//!
//! This is a UX throttle local to the process, not a defence against a
//! determined client: nothing is persisted and nothing is shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::clock::{Clock, to_delta};

/// Algorithm-agnostic limiter interface.
pub trait RateLimiter: Send + Sync {
    /// Returns `true` if a request from `identifier` may proceed now.
    fn try_acquire(&self, identifier: &str) -> bool;

    /// Drop bookkeeping that can no longer affect a decision. Returns the
    /// number of identifiers forgotten.
    fn purge_expired(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateLimitRecord {
    count: u32,
    reset_time: DateTime<Utc>,
}

/// Fixed-window counter per identifier.
///
/// The first request after `reset_time` opens a new window; within a window
/// the first `max_attempts` requests pass and the rest are limited.
///
/// ```
/// use chat_guard::{FixedWindowLimiter, ManualClock};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(ManualClock::default());
/// let limiter = FixedWindowLimiter::new(2, Duration::from_secs(60), clock.clone());
/// assert!(!limiter.is_rate_limited("tab-1"));
/// assert!(!limiter.is_rate_limited("tab-1"));
/// assert!(limiter.is_rate_limited("tab-1"));
/// clock.advance(Duration::from_secs(61));
/// assert!(!limiter.is_rate_limited("tab-1"));
/// ```
pub struct FixedWindowLimiter {
    records: Mutex<HashMap<String, RateLimitRecord>>,
    max_attempts: u32,
    window: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(max_attempts: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_attempts,
            window: to_delta(window),
            clock,
        }
    }

    /// Count a request from `identifier` and report whether it is over the
    /// limit.
    pub fn is_rate_limited(&self, identifier: &str) -> bool {
        let now = self.clock.now();
        let mut records = self.records.lock();

        match records.get_mut(identifier) {
            Some(record) if now <= record.reset_time => {
                if record.count >= self.max_attempts {
                    return true;
                }
                record.count += 1;
                false
            }
            _ => {
                records.insert(
                    identifier.to_string(),
                    RateLimitRecord {
                        count: 1,
                        reset_time: now
                            .checked_add_signed(self.window)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    },
                );
                false
            }
        }
    }

    /// Forget the window of one identifier.
    pub fn reset(&self, identifier: &str) {
        self.records.lock().remove(identifier);
    }

    /// Number of identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.records.lock().len()
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn try_acquire(&self, identifier: &str) -> bool {
        !self.is_rate_limited(identifier)
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| now <= record.reset_time);
        before - records.len()
    }
}
