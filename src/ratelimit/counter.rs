//! Fixed-window counter state.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::clock::offset;
use super::identity::Identity;
use super::policy::PolicyName;

/// Identifies one counter: a policy applied to one caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The policy this counter belongs to
    pub policy: PolicyName,
    /// The caller
    pub identity: Identity,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(policy: PolicyName, identity: Identity) -> Self {
        Self { policy, identity }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.policy, self.identity)
    }
}

/// Snapshot of a counter as returned by a window store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Admissions counted in the current window
    pub count: u64,
    /// When the current window started
    pub window_start: DateTime<Utc>,
}

/// A counter for one fixed window.
///
/// The window starts at the first admission check and lasts `window`. Once it
/// has elapsed the counter is dead, and the next increment replaces it with a
/// fresh window instead of adding to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounter {
    window_start: DateTime<Utc>,
    window: Duration,
    count: u64,
}

impl WindowCounter {
    /// Open a new window at `now` with a count of one.
    pub fn start(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            window_start: now,
            window,
            count: 1,
        }
    }

    /// When this window ends.
    pub fn expires_at(&self) -> DateTime<Utc> {
        offset(self.window_start, self.window)
    }

    /// Whether the window is still open at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// Count one more admission check, saturating at `limit + 1`.
    ///
    /// Denied requests still reach this point; capping keeps the count from
    /// growing past the first rejected request.
    pub fn increment(&mut self, limit: u64) {
        let cap = limit.saturating_add(1);
        if self.count < cap {
            self.count += 1;
        }
    }

    /// Record a check at `now`: bump the live window or start a new one.
    pub fn record(&mut self, now: DateTime<Utc>, limit: u64, window: Duration) {
        if self.is_live(now) {
            self.increment(limit);
        } else {
            *self = WindowCounter::start(now, window);
        }
    }

    /// Whether the counter can be dropped at `now`, allowing `grace_multiple`
    /// extra windows past expiry.
    pub fn is_reapable(&self, now: DateTime<Utc>, grace_multiple: u32) -> bool {
        let grace = self.window.saturating_mul(grace_multiple);
        now >= offset(self.expires_at(), grace)
    }

    /// The current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Snapshot for callers outside the store.
    pub fn state(&self) -> WindowState {
        WindowState {
            count: self.count,
            window_start: self.window_start,
        }
    }
}
