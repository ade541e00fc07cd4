//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for shared throttle counters.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Prefix of every counter entry in a node's gossip state.
const COUNTER_PREFIX: &str = "counter|";

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
            cluster_id: "floodgate".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Gossip state key for a counter.
fn chitchat_key(key: &str) -> String {
    format!("{}{}", COUNTER_PREFIX, key)
}

/// The cluster handle for distributed counter state.
///
/// Each node gossips only its own contribution to a counter; the cluster-wide
/// count is the sum over all live nodes.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
    /// Expiry (unix seconds) of each counter this node has written.
    /// Only touched while the chitchat lock is held.
    expiries: SyncMutex<HashMap<String, u64>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
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
            node_id: config.node_id.clone(),
            handle,
            config,
            expiries: SyncMutex::new(HashMap::new()),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Add to our contribution for a counter and return the cluster-wide total.
    ///
    /// The chitchat lock is held for the whole read-modify-write, so local
    /// increments are atomic.
    pub async fn increment_counter(&self, key: &str, amount: u64) -> u64 {
        let chitchat_key = chitchat_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: u64 = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + amount;
        chitchat
            .self_node_state()
            .set(&chitchat_key, new_local.to_string());

        debug!(
            key = %chitchat_key,
            local_value = new_local,
            "Incremented local counter"
        );

        sum_counter(&chitchat, &chitchat_key)
    }

    /// Add to our contribution for an expiring counter and return the
    /// cluster-wide total.
    ///
    /// If our share has expired at `now` it is reset before the increment.
    /// The expiry check, the reset and the increment all happen under one
    /// chitchat lock, so concurrent callers at a window boundary reset the
    /// counter at most once.
    pub async fn increment_expiring(
        &self,
        key: &str,
        amount: u64,
        now: u64,
        ttl_secs: u64,
    ) -> u64 {
        let chitchat_key = chitchat_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let mut expiries = self.expiries.lock();

        let expired = expiries.get(key).is_some_and(|expires_at| now >= *expires_at);
        let current_local: u64 = if expired {
            debug!(key = %chitchat_key, "Resetting expired local counter");
            expiries.remove(key);
            0
        } else {
            chitchat
                .self_node_state()
                .get(&chitchat_key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        let new_local = current_local + amount;
        chitchat
            .self_node_state()
            .set(&chitchat_key, new_local.to_string());
        expiries
            .entry(key.to_string())
            .or_insert_with(|| now.saturating_add(ttl_secs));

        sum_counter(&chitchat, &chitchat_key)
    }

    /// Cluster-wide total for an expiring counter, or `None` once our share
    /// has expired or nothing has been counted.
    pub async fn get_live_count(&self, key: &str, now: u64) -> Option<u64> {
        let chitchat_key = chitchat_key(key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        let expired = self
            .expiries
            .lock()
            .get(key)
            .is_some_and(|expires_at| now >= *expires_at);
        if expired {
            return None;
        }
        let total = sum_counter(&chitchat, &chitchat_key);
        (total > 0).then_some(total)
    }

    /// Drop our share of every counter expired at `now`. Returns how many
    /// were removed.
    pub async fn remove_expired(&self, now: u64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let mut expiries = self.expiries.lock();

        let before = expiries.len();
        expiries.retain(|key, expires_at| {
            let keep = now < *expires_at;
            if !keep {
                chitchat.self_node_state().delete(&chitchat_key(key));
            }
            keep
        });
        before - expiries.len()
    }

    /// Drop our share of every expiring counter.
    pub async fn clear_counters(&self) {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        for (key, _) in self.expiries.lock().drain() {
            chitchat.self_node_state().delete(&chitchat_key(&key));
        }
    }

    /// Get the total count for a key across all nodes.
    pub async fn get_count(&self, key: &str) -> u64 {
        let chitchat_key = chitchat_key(key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        sum_counter(&chitchat, &chitchat_key)
    }

    /// Drop our contribution to a counter. The deletion is gossiped to peers.
    pub async fn remove_counter(&self, key: &str) {
        let chitchat_key = chitchat_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat.self_node_state().delete(&chitchat_key);
        self.expiries.lock().remove(key);

        debug!(key = %chitchat_key, "Removed local counter");
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

/// Sum a counter across all live nodes (including ourselves).
fn sum_counter(chitchat: &chitchat::Chitchat, key: &str) -> u64 {
    chitchat
        .live_nodes()
        .filter_map(|node_id| chitchat.node_state(node_id))
        .filter_map(|node_state| node_state.get(key))
        .filter_map(|value| value.parse::<u64>().ok())
        .sum()
}
