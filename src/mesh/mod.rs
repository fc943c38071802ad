//! Peer mesh networking using Chitchat.
//!
//! Tollgate instances that need a shared quota join a gossip mesh; each node
//! publishes its own contribution to every window counter and reads the sum
//! across live peers.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, MeshKey};
