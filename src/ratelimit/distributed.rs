//! Window store shared across instances through the gossip mesh.
//!
//! Nodes cannot agree on a "first use" instant without coordination, so this
//! store aligns every window to a multiple of the window length since the
//! Unix epoch. Within a window the counter is the sum of every live node's
//! contribution; counts converge as gossip propagates, so the global limit is
//! approximate while a burst is still in flight between nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use crate::mesh::{Cluster, MeshKey};

use super::clock::Clock;
use super::counter::{CounterKey, WindowState};
use super::store::{StoreError, WindowStore};

/// Default bound on a single mesh call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// A window store backed by chitchat cluster state.
pub struct MeshWindowStore {
    /// The cluster for distributed state.
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
    /// Upper bound on how long a call may wait for the cluster state lock.
    timeout: Duration,
}

impl MeshWindowStore {
    /// Create a new mesh-backed store.
    pub fn new(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cluster,
            clock,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Window containing the current instant, as epoch seconds.
    fn current_window(&self, window: Duration) -> Result<(u64, DateTime<Utc>), StoreError> {
        let now = self.clock.now().timestamp().max(0) as u64;
        let start = align_window(now, window);
        let start_at = DateTime::<Utc>::from_timestamp(start as i64, 0)
            .ok_or_else(|| StoreError::Backend(format!("window start {} out of range", start)))?;
        Ok((start, start_at))
    }

    fn mesh_key(key: &CounterKey, window_start: u64, window: Duration) -> MeshKey {
        MeshKey::new(
            key.policy.as_str(),
            key.identity.as_str(),
            window_start,
            window_secs(window),
        )
    }
}

/// Window length in whole seconds, at least one.
///
/// Mesh windows are keyed and aligned in epoch seconds, so sub-second parts
/// of `window` are dropped. Policy windows are whole seconds.
fn window_secs(window: Duration) -> u64 {
    debug_assert_eq!(window.subsec_nanos(), 0, "mesh windows must be whole seconds");
    window.as_secs().max(1)
}

/// Floor `now` (epoch seconds) to the start of its window.
fn align_window(now: u64, window: Duration) -> u64 {
    let len = window_secs(window);
    (now / len) * len
}

#[async_trait]
impl WindowStore for MeshWindowStore {
    async fn increment_and_read(
        &self,
        key: &CounterKey,
        limit: u64,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        let (start, window_start) = self.current_window(window)?;
        let mesh_key = Self::mesh_key(key, start, window);

        trace!(key = %key, window = start, "Incrementing mesh window counter");

        let count = tokio::time::timeout(
            self.timeout,
            self.cluster.increment_capped(&mesh_key, limit.saturating_add(1)),
        )
        .await
        .map_err(|_| {
            warn!(key = %key, timeout = ?self.timeout, "Mesh increment timed out");
            StoreError::Timeout(self.timeout)
        })?;

        Ok(WindowState {
            count,
            window_start,
        })
    }

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<Option<WindowState>, StoreError> {
        let (start, window_start) = self.current_window(window)?;
        let mesh_key = Self::mesh_key(key, start, window);

        let count = tokio::time::timeout(self.timeout, self.cluster.get_count(&mesh_key))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?;

        Ok((count > 0).then_some(WindowState {
            count,
            window_start,
        }))
    }

    async fn sweep(&self, grace_multiple: u32) -> Result<usize, StoreError> {
        let now = self.clock.now().timestamp().max(0) as u64;

        tokio::time::timeout(
            self.timeout,
            self.cluster
                .remove_windows(|key| key.is_reapable(now, grace_multiple)),
        )
        .await
        .map_err(|_| {
            warn!(timeout = ?self.timeout, "Mesh sweep timed out");
            StoreError::Timeout(self.timeout)
        })
    }

    async fn live_nodes(&self) -> Option<usize> {
        tokio::time::timeout(self.timeout, self.cluster.live_node_count())
            .await
            .ok()
    }

    fn name(&self) -> &'static str {
        "mesh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::identity::Identity;
    use crate::ratelimit::policy::PolicyName;
    use chrono::TimeZone;
    use tokio_test::assert_err;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: std::net::SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    fn key() -> CounterKey {
        CounterKey::new(PolicyName::Authentication, Identity::new("198.51.100.1"))
    }

    #[test]
    fn test_align_window() {
        assert_eq!(align_window(125, Duration::from_secs(60)), 120);
        assert_eq!(align_window(120, Duration::from_secs(60)), 120);
        assert_eq!(align_window(3600 * 5 + 17, Duration::from_secs(3600)), 3600 * 5);
    }

    #[tokio::test]
    async fn test_mesh_store_counts_and_rolls_over() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18946)).await.unwrap());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        let clock = ManualClock::new(start);

        {
            let store = MeshWindowStore::new(cluster.clone(), Arc::new(clock.clone()));
            let window = Duration::from_secs(60);

            let first = store.increment_and_read(&key(), 5, window).await.unwrap();
            assert_eq!(first.count, 1);
            assert_eq!(
                first.window_start,
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            );

            let second = store.increment_and_read(&key(), 5, window).await.unwrap();
            assert_eq!(second.count, 2);

            let peeked = store.peek(&key(), window).await.unwrap();
            assert_eq!(peeked.map(|s| s.count), Some(2));

            clock.advance(Duration::from_secs(60));
            assert!(store.peek(&key(), window).await.unwrap().is_none());

            let rolled = store.increment_and_read(&key(), 5, window).await.unwrap();
            assert_eq!(rolled.count, 1);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_sweeps_elapsed_windows() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18948)).await.unwrap());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        {
            let store = MeshWindowStore::new(cluster.clone(), Arc::new(clock.clone()));
            let window = Duration::from_secs(60);

            for i in 0..50 {
                let key = CounterKey::new(
                    PolicyName::Default,
                    Identity::new(format!("203.0.113.{}", i)),
                );
                store.increment_and_read(&key, 1000, window).await.unwrap();
                clock.advance(window);
            }
            assert_eq!(cluster.local_window_count().await, 50);

            // The last window ended at the current instant; one window of grace keeps it.
            assert_eq!(store.sweep(1).await.unwrap(), 49);
            assert_eq!(cluster.local_window_count().await, 1);

            clock.advance(Duration::from_secs(3600));
            assert_eq!(store.sweep(1).await.unwrap(), 1);
            assert_eq!(cluster.local_window_count().await, 0);
            assert_eq!(store.sweep(1).await.unwrap(), 0);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_sweep_keeps_live_window() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18949)).await.unwrap());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap());

        {
            let store = MeshWindowStore::new(cluster.clone(), Arc::new(clock.clone()));
            let window = Duration::from_secs(60);

            store.increment_and_read(&key(), 5, window).await.unwrap();
            assert_eq!(store.sweep(0).await.unwrap(), 0);
            assert_eq!(
                store.peek(&key(), window).await.unwrap().map(|s| s.count),
                Some(1)
            );
            assert_eq!(store.live_nodes().await, Some(1));
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_times_out_when_state_is_locked() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18947)).await.unwrap());

        {
            let store = MeshWindowStore::new(cluster.clone(), Arc::new(crate::ratelimit::SystemClock))
                .with_timeout(Duration::from_millis(20));

            let chitchat = cluster.chitchat();
            let _held = chitchat.lock().await;

            let result = store
                .increment_and_read(&key(), 5, Duration::from_secs(60))
                .await;
            assert!(matches!(assert_err!(result), StoreError::Timeout(_)));
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
