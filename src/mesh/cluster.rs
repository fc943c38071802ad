//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of per-node window counters.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "tollgate".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Prefix shared by every window counter key in the cluster state.
pub const WINDOW_KEY_PREFIX: &str = "window|";

/// Key identifying one window's counter in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshKey {
    /// Policy name.
    pub policy: String,
    /// Caller identity.
    pub identity: String,
    /// Window start (epoch seconds, aligned to the window length).
    pub window: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl MeshKey {
    /// Create a new mesh key.
    pub fn new(policy: &str, identity: &str, window: u64, window_secs: u64) -> Self {
        Self {
            policy: policy.to_string(),
            identity: identity.to_string(),
            window,
            window_secs,
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "window|{policy}|{identity}|{window}|{window_secs}"
    pub fn to_chitchat_key(&self) -> String {
        format!(
            "{}{}|{}|{}|{}",
            WINDOW_KEY_PREFIX, self.policy, self.identity, self.window, self.window_secs
        )
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(WINDOW_KEY_PREFIX)?;

        // Window start and length are the last two fields, policy the first;
        // the identity keeps whatever is in between.
        let (rest, window_secs) = rest.rsplit_once('|')?;
        let window_secs: u64 = window_secs.parse().ok()?;
        let (rest, window) = rest.rsplit_once('|')?;
        let window: u64 = window.parse().ok()?;
        let (policy, identity) = rest.split_once('|')?;

        Some(Self {
            policy: policy.to_string(),
            identity: identity.to_string(),
            window,
            window_secs,
        })
    }

    /// Epoch second at which this window ends.
    pub fn expires_at(&self) -> u64 {
        self.window.saturating_add(self.window_secs)
    }

    /// Whether the window ended at least `grace_multiple` windows before `now`.
    pub fn is_reapable(&self, now: u64, grace_multiple: u32) -> bool {
        let grace = self.window_secs.saturating_mul(u64::from(grace_multiple));
        now >= self.expires_at().saturating_add(grace)
    }
}

/// The cluster handle for distributed counter state.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add one to our contribution for `key` unless the cluster-wide total
    /// already reached `cap`.
    ///
    /// Returns the cluster-wide total after the (possible) increment. The
    /// chitchat state lock is held across the read and the write, so local
    /// callers for the same key are serialized.
    pub async fn increment_capped(&self, key: &MeshKey, cap: u64) -> u64 {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let total = Self::sum_counter(&chitchat, &chitchat_key);
        if total >= cap {
            return total;
        }

        let current_local: u64 = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + 1;
        chitchat
            .self_node_state()
            .set(&chitchat_key, new_local.to_string());

        debug!(
            key = %chitchat_key,
            local_value = new_local,
            "Incremented local window counter"
        );

        total + 1
    }

    /// Get the total count for a key across all live nodes.
    pub async fn get_count(&self, key: &MeshKey) -> u64 {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::sum_counter(&chitchat, &chitchat_key)
    }

    /// Sum a counter across all live nodes, ourselves included.
    fn sum_counter(chitchat: &chitchat::Chitchat, key: &str) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(key))
            .filter_map(|value| value.parse::<u64>().ok())
            .sum()
    }

    /// Delete our own window counters matching `is_stale`.
    ///
    /// Deleted keys become tombstones that gossip propagates to peers;
    /// chitchat drops them for good after the dead node grace period.
    /// Returns the number of keys deleted.
    pub async fn remove_windows<F>(&self, is_stale: F) -> usize
    where
        F: Fn(&MeshKey) -> bool,
    {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let state = chitchat.self_node_state();

        let stale: Vec<String> = state
            .iter_prefix(WINDOW_KEY_PREFIX)
            .filter(|(key, _)| MeshKey::from_chitchat_key(key).is_some_and(|k| is_stale(&k)))
            .map(|(key, _)| key.to_string())
            .collect();

        for key in &stale {
            state.delete(key);
        }

        if !stale.is_empty() {
            debug!(removed = stale.len(), "Deleted elapsed window counters");
        }
        stale.len()
    }

    /// Number of window counter keys this node currently holds.
    pub async fn local_window_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat.self_node_state().iter_prefix(WINDOW_KEY_PREFIX).count()
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))
    }
}
