//! Sliding-window admission control.
//!
//! A [`SlidingWindow`] tracks recent send timestamps and enforces a
//! per-minute cap, a per-hour cap and a minimum delay between sends. The
//! shared [`RateLimiter`] wraps one window behind a lock so that the check and
//! the record happen in a single critical section ([`RateLimiter::try_admit`]).
//! [`RateLimiterManager`] keeps one window per key (e.g. per recipient).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Configuration for a sliding-window limiter.
///
/// A cap of `0` disables that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum sends in any rolling 60 seconds.
    pub per_minute: u32,
    /// Maximum sends in any rolling hour.
    pub per_hour: u32,
    /// Minimum spacing between two sends.
    pub min_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1000,
            min_delay: Duration::ZERO,
        }
    }
}

impl RateLimitConfig {
    /// Only an hourly cap, as used for per-recipient limits.
    pub fn hourly(per_hour: u32) -> Self {
        Self {
            per_minute: 0,
            per_hour,
            min_delay: Duration::ZERO,
        }
    }

    /// Whether every window is disabled.
    pub fn is_unlimited(&self) -> bool {
        self.per_minute == 0 && self.per_hour == 0 && self.min_delay.is_zero()
    }

    /// How long timestamps must be kept to evaluate the enabled windows.
    fn retention(&self) -> Duration {
        if self.per_hour > 0 {
            HOUR
        } else if self.per_minute > 0 {
            MINUTE
        } else {
            Duration::ZERO
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied {
        /// Human-readable reason.
        reason: String,
        /// Time until the blocking window frees up.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    /// Reason for a denial, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Granted => None,
            Self::Denied { reason, .. } => Some(reason),
        }
    }
}

/// Current usage of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub last_minute: usize,
    pub last_hour: usize,
}

/// Sliding-window limiter state.
#[derive(Debug)]
pub struct SlidingWindow {
    config: RateLimitConfig,
    sent: VecDeque<Instant>,
    last_sent: Option<Instant>,
}

impl SlidingWindow {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            sent: VecDeque::new(),
            last_sent: None,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether a send may proceed now without recording it.
    pub fn can_send(&mut self) -> Admission {
        self.can_send_at(Instant::now())
    }

    /// Record a send now.
    pub fn record_sent(&mut self) {
        self.record_sent_at(Instant::now());
    }

    /// Check and, if granted, record a send now.
    pub fn try_admit(&mut self) -> Admission {
        self.try_admit_at(Instant::now())
    }

    /// Check and, if granted, record a send at `now`.
    pub fn try_admit_at(&mut self, now: Instant) -> Admission {
        let admission = self.can_send_at(now);
        if admission.is_granted() {
            self.record_sent_at(now);
        }
        admission
    }

    /// Check whether a send may proceed at `now`.
    pub fn can_send_at(&mut self, now: Instant) -> Admission {
        self.purge(now);

        if let Some(last) = self.last_sent {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.min_delay {
                return Admission::Denied {
                    reason: format!(
                        "minimum delay of {:?} between sends not elapsed",
                        self.config.min_delay
                    ),
                    retry_after: self.config.min_delay - elapsed,
                };
            }
        }

        if self.config.per_minute > 0 {
            let in_minute = self.count_within(now, MINUTE);
            if in_minute >= self.config.per_minute as usize {
                let oldest = self.sent[self.sent.len() - in_minute];
                return Admission::Denied {
                    reason: format!(
                        "rate limit exceeded: {} per minute",
                        self.config.per_minute
                    ),
                    retry_after: MINUTE.saturating_sub(now.saturating_duration_since(oldest)),
                };
            }
        }

        if self.config.per_hour > 0 && self.sent.len() >= self.config.per_hour as usize {
            let retry_after = self
                .sent
                .front()
                .map(|oldest| HOUR.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or_default();
            return Admission::Denied {
                reason: format!("rate limit exceeded: {} per hour", self.config.per_hour),
                retry_after,
            };
        }

        Admission::Granted
    }

    /// Record a send at `now`.
    pub fn record_sent_at(&mut self, now: Instant) {
        self.last_sent = Some(now);
        if self.config.retention().is_zero() {
            return;
        }
        self.sent.push_back(now);
        self.purge(now);
    }

    /// Usage counts at `now`.
    pub fn usage_at(&mut self, now: Instant) -> WindowUsage {
        self.purge(now);
        WindowUsage {
            last_minute: self.count_within(now, MINUTE),
            last_hour: self.count_within(now, HOUR),
        }
    }

    /// Whether the window holds no live state at `now`.
    pub fn is_idle_at(&mut self, now: Instant) -> bool {
        self.purge(now);
        let delay_over = self
            .last_sent
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.min_delay);
        self.sent.is_empty() && delay_over
    }

    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.sent
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    fn purge(&mut self, now: Instant) {
        let retention = self.config.retention();
        while let Some(front) = self.sent.front() {
            if now.saturating_duration_since(*front) >= retention {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Shared limiter guarding one resource.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    window: Mutex<SlidingWindow>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            window: Mutex::new(SlidingWindow::new(config)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically check and record a send.
    pub fn try_admit(&self) -> Admission {
        self.try_admit_at(Instant::now())
    }

    pub fn try_admit_at(&self, now: Instant) -> Admission {
        let admission = self.window.lock().try_admit_at(now);
        if let Admission::Denied { reason, retry_after } = &admission {
            trace!(limiter = %self.name, retry_after = ?retry_after, "{}", reason);
        }
        admission
    }

    /// Check without recording.
    ///
    /// The answer may be stale by the time the caller acts on it; use
    /// [`try_admit`](Self::try_admit) to gate a send.
    pub fn can_send(&self) -> Admission {
        self.window.lock().can_send_at(Instant::now())
    }

    /// Record a send admitted elsewhere.
    pub fn record_sent(&self) {
        self.window.lock().record_sent_at(Instant::now());
    }

    pub fn usage(&self) -> WindowUsage {
        self.window.lock().usage_at(Instant::now())
    }
}

/// Manager for keyed limiters sharing one configuration.
#[derive(Debug)]
pub struct RateLimiterManager {
    config: RateLimitConfig,
    limiters: Mutex<HashMap<String, SlidingWindow>>,
}

impl RateLimiterManager {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically check and record a send for `key`.
    pub fn try_admit(&self, key: &str) -> Admission {
        self.try_admit_at(key, Instant::now())
    }

    pub fn try_admit_at(&self, key: &str, now: Instant) -> Admission {
        if self.config.is_unlimited() {
            return Admission::Granted;
        }

        let mut limiters = self.limiters.lock();
        let window = match limiters.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(SlidingWindow::new(self.config)),
        };
        window.try_admit_at(now)
    }

    /// Drop windows with no live state. Returns the number removed.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let mut limiters = self.limiters.lock();
        let before = limiters.len();
        limiters.retain(|_, window| !window.is_idle_at(now));
        let removed = before - limiters.len();
        if removed > 0 {
            debug!(removed, remaining = limiters.len(), "Pruned idle rate limiters");
        }
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RateLimiterManager {
    fn default() -> Self {
        Self::new(RateLimitConfig::hourly(100))
    }
}
