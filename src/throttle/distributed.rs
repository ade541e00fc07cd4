//! Distributed counter store using Chitchat cluster state.
//!
//! Counters are gossiped between Floodgate instances so every node throttles
//! against the cluster-wide count. Each node only writes its own share of a
//! counter; totals are eventually consistent, so a burst spread across nodes
//! can briefly exceed a limit by up to one gossip interval's worth of
//! requests.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::Clock;
use super::store::{CounterStore, StoreError};
use crate::mesh::Cluster;

/// A [`CounterStore`] backed by the gossip mesh.
///
/// Window keys embed their window index, so a rolled-over window always
/// uses a fresh key. Expiry only reclaims this node's share of old keys.
pub struct MeshStore {
    /// The cluster for distributed state.
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
}

impl MeshStore {
    pub fn new(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self { cluster, clock }
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        self.cluster.live_node_count().await
    }

    /// Remove this node's share of every expired counter. Returns how many
    /// were removed.
    pub async fn sweep_expired(&self) -> usize {
        self.cluster.remove_expired(self.clock.unix_secs()).await
    }

    /// Periodically sweep expired counters until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep_expired().await;
                if removed > 0 {
                    debug!(removed, "Swept expired mesh counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MeshStore {
    async fn increment(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError> {
        let now = self.clock.unix_secs();
        let total = self.cluster.increment_expiring(key, 1, now, ttl_secs).await;

        trace!(key = %key, total, "Incremented mesh counter");
        Ok(total)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.cluster.get_live_count(key, self.clock.unix_secs()).await)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.cluster.clear_counters().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use crate::throttle::{Discriminator, MockClock, RequestDescriptor, RuleSet, Throttler};
    use std::net::SocketAddr;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
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

    async fn start_store(port: u16, clock: &MockClock) -> (Arc<Cluster>, MeshStore) {
        let cluster = Arc::new(Cluster::start(test_cluster_config(port)).await.unwrap());
        let store = MeshStore::new(cluster.clone(), Arc::new(clock.clone()));
        (cluster, store)
    }

    async fn shutdown(cluster: Arc<Cluster>) {
        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_increment_and_get() {
        let clock = MockClock::at_epoch(0);
        let (cluster, store) = start_store(18946, &clock).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", 60).await.unwrap(), 1);
        assert_eq!(store.increment("k", 60).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(2));
        assert_eq!(store.live_node_count().await, 1);

        drop(store);
        shutdown(cluster).await;
    }

    #[tokio::test]
    async fn test_mesh_store_expiry() {
        let clock = MockClock::at_epoch(0);
        let (cluster, store) = start_store(18947, &clock).await;

        store.increment("k", 10).await.unwrap();
        store.increment("k", 10).await.unwrap();

        clock.travel(10);
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", 10).await.unwrap(), 1);

        clock.travel(10);
        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(cluster.get_count("k").await, 0);

        drop(store);
        shutdown(cluster).await;
    }

    #[tokio::test]
    async fn test_mesh_store_clear() {
        let clock = MockClock::at_epoch(0);
        let (cluster, store) = start_store(18948, &clock).await;

        store.increment("a", 60).await.unwrap();
        store.increment("b", 60).await.unwrap();
        store.clear().await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), None);

        drop(store);
        shutdown(cluster).await;
    }

    #[tokio::test]
    async fn test_throttler_over_mesh_store() {
        let clock = MockClock::at_epoch(0);
        let (cluster, store) = start_store(18949, &clock).await;

        let rules = RuleSet::builder()
            .throttle("by ip", 2_u64, 60_u64, Discriminator::by_ip())
            .unwrap()
            .build();
        let throttler = Throttler::new(rules, Arc::new(store), Arc::new(clock.clone()));
        let request = RequestDescriptor::new().with_ip("1.2.3.4".parse().unwrap());

        assert!(throttler.check(&request).await.unwrap().is_allowed());
        assert!(throttler.check(&request).await.unwrap().is_allowed());
        assert!(!throttler.check(&request).await.unwrap().is_allowed());

        drop(throttler);
        shutdown(cluster).await;
    }

    #[tokio::test]
    async fn test_mesh_stores_share_counts() {
        let clock = MockClock::at_epoch(0);
        let (cluster1, store1) = start_store(18950, &clock).await;

        let mut config2 = test_cluster_config(18951);
        config2.seed_nodes = vec!["127.0.0.1:18950".to_string()];
        let cluster2 = Arc::new(Cluster::start(config2).await.unwrap());
        let store2 = MeshStore::new(cluster2.clone(), Arc::new(clock.clone()));

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store1.live_node_count().await, 2);

        store1.increment("shared", 60).await.unwrap();
        store1.increment("shared", 60).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store2.increment("shared", 60).await.unwrap(), 3);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store1.get("shared").await.unwrap(), Some(3));

        drop(store1);
        drop(store2);
        shutdown(cluster1).await;
        shutdown(cluster2).await;
    }
}
