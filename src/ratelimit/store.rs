//! Window stores: where counters live.
//!
//! The limiter talks to a [`WindowStore`] only. The in-memory store below is
//! the single-process backend; the mesh-backed store in
//! [`super::distributed`] shares counters between instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::counter::{CounterKey, WindowCounter, WindowState};

/// Errors a window store can report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend did not answer in time.
    #[error("window store timed out after {0:?}")]
    Timeout(Duration),

    /// The backend cannot be reached.
    #[error("window store unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something unusable.
    #[error("window store error: {0}")]
    Backend(String),
}

/// Keyed fixed-window counters.
///
/// Implementations must make `increment_and_read` indivisible per key: two
/// concurrent calls for the same key never observe the same pre-increment
/// count.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Count one admission check for `key`.
    ///
    /// Starts a fresh window with a count of one when no live counter exists,
    /// otherwise increments the live one (saturating at `limit + 1`). Returns
    /// the count after the increment and the start of the window it landed in.
    async fn increment_and_read(
        &self,
        key: &CounterKey,
        limit: u64,
        window: Duration,
    ) -> Result<WindowState, StoreError>;

    /// Read the live counter for `key` without touching it.
    async fn peek(&self, key: &CounterKey, window: Duration)
        -> Result<Option<WindowState>, StoreError>;

    /// Drop counters whose window ended more than `grace_multiple` windows ago.
    ///
    /// Returns the number of counters removed.
    async fn sweep(&self, grace_multiple: u32) -> Result<usize, StoreError>;

    /// Cluster members currently sharing this store, if it is shared at all.
    async fn live_nodes(&self) -> Option<usize>;

    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;
}

/// In-process window store.
///
/// Counters sit in a sharded map; each increment holds the shard lock for its
/// key while it reads, decides and writes, so updates to one key are
/// serialized while unrelated keys in other shards proceed in parallel.
pub struct MemoryWindowStore {
    counters: DashMap<CounterKey, WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryWindowStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Number of counters physically held, live or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Remove every counter.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn increment_and_read(
        &self,
        key: &CounterKey,
        limit: u64,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        let now = self.clock.now();

        let state = match self.counters.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let counter = entry.get_mut();
                if !counter.is_live(now) {
                    debug!(key = %key, "Window elapsed, starting a new one");
                }
                counter.record(now, limit, window);
                counter.state()
            }
            Entry::Vacant(entry) => {
                debug!(
                    key = %key,
                    limit = limit,
                    window = ?window,
                    "Creating new window counter"
                );
                entry.insert(WindowCounter::start(now, window)).state()
            }
        };

        trace!(key = %key, count = state.count, "Counter incremented");
        Ok(state)
    }

    async fn peek(
        &self,
        key: &CounterKey,
        _window: Duration,
    ) -> Result<Option<WindowState>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .filter(|counter| counter.is_live(now))
            .map(|counter| counter.state()))
    }

    async fn sweep(&self, grace_multiple: u32) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| !counter.is_reapable(now, grace_multiple));
        Ok(before.saturating_sub(self.counters.len()))
    }

    async fn live_nodes(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Run `sweep` every `interval` until the returned task is aborted.
pub fn spawn_sweeper(
    store: Arc<dyn WindowStore>,
    interval: Duration,
    grace_multiple: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.sweep(grace_multiple).await {
                Ok(0) => {}
                Ok(removed) => debug!(store = store.name(), removed, "Swept stale counters"),
                Err(e) => warn!(store = store.name(), error = %e, "Counter sweep failed"),
            }
        }
    })
}
