//! Gossip-mesh origin counter using Chitchat.
//!
//! Every node publishes its own contribution to each counter in its chitchat
//! node state; reading a counter sums the contributions of all live nodes.
//! Totals are eventually consistent, which is all the decision protocol
//! expects from an origin.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::OriginCounter;
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::{GatekeeperError, Result};

const KEY_PREFIX: &str = "counter|";

/// Configuration for the gossip mesh.
#[derive(Debug, Clone)]
pub struct GossipConfig {
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

impl Default for GossipConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "gatekeeper".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Origin counter spread over a chitchat cluster.
pub struct GossipCounter {
    node_id: String,
    chitchat: Arc<Mutex<Chitchat>>,
    handle: parking_lot::Mutex<Option<ChitchatHandle>>,
    /// Expiry deadline (epoch ms) of every key this node has published.
    expiries: parking_lot::Mutex<HashMap<String, i64>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for GossipCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipCounter")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl GossipCounter {
    /// Create and start a new mesh node.
    pub async fn start(config: GossipConfig) -> Result<Self> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting gossip origin node"
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
            .map_err(|e| GatekeeperError::OriginUnavailable(format!("gossip start: {}", e)))?;

        info!("Gossip origin node started");

        Ok(Self {
            node_id: config.node_id,
            chitchat: handle.chitchat(),
            handle: parking_lot::Mutex::new(Some(handle)),
            expiries: parking_lot::Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of live nodes in the mesh.
    pub async fn live_node_count(&self) -> usize {
        let chitchat = self.chitchat.lock().await;
        chitchat.live_nodes().count()
    }

    /// Remove keys whose expiry has passed from our own node state.
    fn purge_expired(&self, chitchat: &mut Chitchat, now: i64) {
        let mut expiries = self.expiries.lock();
        let expired: Vec<String> = expiries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            expiries.remove(&key);
            chitchat.self_node_state().delete(&key);
            trace!(key = %key, "Deleted expired gossip counter");
        }
    }
}

fn chitchat_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

fn parse_value(key: &str, value: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|_| {
        GatekeeperError::MalformedOriginResponse(format!(
            "gossip key {} holds non-integer value {:?}",
            key, value
        ))
    })
}

/// Sum a counter across all live nodes (including ourselves).
fn sum_counter(chitchat: &Chitchat, key: &str) -> Result<i64> {
    let mut total: i64 = 0;
    for node_id in chitchat.live_nodes() {
        if let Some(node_state) = chitchat.node_state(node_id) {
            if let Some(value) = node_state.get(key) {
                total += parse_value(key, value)?;
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl OriginCounter for GossipCounter {
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let key = chitchat_key(key);
        let now = self.clock.now_millis();
        let mut chitchat = self.chitchat.lock().await;

        self.purge_expired(&mut chitchat, now);

        let current_local = match chitchat.self_node_state().get(&key) {
            Some(value) => parse_value(&key, value)?,
            None => 0,
        };
        let new_local = current_local + delta;
        chitchat.self_node_state().set(&key, new_local.to_string());
        self.expiries
            .lock()
            .insert(key.clone(), now.saturating_add(duration_millis(ttl)));

        debug!(key = %key, local_value = new_local, "Incremented gossip counter");

        sum_counter(&chitchat, &key)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let chitchat = self.chitchat.lock().await;
        sum_counter(&chitchat, &chitchat_key(key))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<i64>> {
        let chitchat = self.chitchat.lock().await;
        keys.iter()
            .map(|key| sum_counter(&chitchat, &chitchat_key(key)))
            .collect()
    }

    async fn close(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            info!(node_id = %self.node_id, "Shutting down gossip origin node");
            handle
                .shutdown()
                .await
                .map_err(|e| GatekeeperError::OriginUnavailable(format!("gossip shutdown: {:?}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> GossipConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        GossipConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_chitchat_key() {
        assert_eq!(chitchat_key("rpm:user_1:5:60000:9"), "counter|rpm:user_1:5:60000:9");
    }

    #[test]
    fn test_parse_value_invalid() {
        assert!(parse_value("k", "12").is_ok());
        assert!(parse_value("k", "twelve").unwrap_err().is_malformed());
    }

    #[tokio::test]
    async fn test_gossip_counter_single_node() {
        let counter = GossipCounter::start(test_config(17946)).await.unwrap();
        let ttl = Duration::from_secs(60);

        assert_eq!(counter.node_id(), "test-node-17946");
        assert_eq!(counter.live_node_count().await, 1);

        assert_eq!(counter.increment("key1", 5, ttl).await.unwrap(), 5);
        assert_eq!(counter.increment("key1", 3, ttl).await.unwrap(), 8);
        assert_eq!(counter.get("key1").await.unwrap(), 8);

        let keys = vec!["key1".to_string(), "nope".to_string()];
        assert_eq!(counter.multi_get(&keys).await.unwrap(), vec![8, 0]);

        counter.close().await.unwrap();
        // Closing twice is harmless
        counter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gossip_counter_two_nodes() {
        let node1 = GossipCounter::start(test_config(17948)).await.unwrap();

        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let node2 = GossipCounter::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(node1.live_node_count().await, 2);
        assert_eq!(node2.live_node_count().await, 2);

        let ttl = Duration::from_secs(60);
        node1.increment("shared", 10, ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node2.get("shared").await.unwrap(), 10);

        node2.increment("shared", 5, ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node1.get("shared").await.unwrap(), 15);
        assert_eq!(node2.get("shared").await.unwrap(), 15);

        node1.close().await.unwrap();
        node2.close().await.unwrap();
    }
}
