//! Origin counter stores.
//!
//! The origin is the cross-node counter every node reconciles its local
//! windows against. Decisions read from it only when local data cannot be
//! trusted; replay workers write granted cost to it asynchronously.

mod gossip;
mod memory;
mod redis_counter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::OriginConfig;
use crate::error::Result;

pub use self::gossip::{GossipConfig, GossipCounter};
pub use self::memory::MemoryCounter;
pub use self::redis_counter::RedisCounter;

/// Trait for distributed counter stores.
///
/// Implementations must be safe to call from many tasks at once. Missing
/// keys read as zero.
#[async_trait]
pub trait OriginCounter: Send + Sync {
    /// Add `delta` to `key`, (re)arming its expiry, and return the new total.
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Read the current total of `key`.
    async fn get(&self, key: &str) -> Result<i64>;

    /// Read several keys at once; the result has one value per key, in order.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<i64>>;

    /// Release connections and background resources.
    async fn close(&self) -> Result<()>;
}

/// Build the origin counter selected by configuration.
pub async fn connect(config: &OriginConfig) -> Result<Arc<dyn OriginCounter>> {
    match config {
        OriginConfig::Memory => Ok(Arc::new(MemoryCounter::new())),
        OriginConfig::Redis { url, key_prefix } => {
            Ok(Arc::new(RedisCounter::connect(url, key_prefix).await?))
        }
        OriginConfig::Gossip {
            node_id,
            listen_addr,
            advertise_addr,
            seed_nodes,
            cluster_id,
            gossip_interval_ms,
        } => {
            let config = GossipConfig {
                node_id: node_id.clone(),
                listen_addr: *listen_addr,
                advertise_addr: advertise_addr.unwrap_or(*listen_addr),
                seed_nodes: seed_nodes.clone(),
                cluster_id: cluster_id.clone(),
                gossip_interval: Duration::from_millis(*gossip_interval_ms),
                ..GossipConfig::default()
            };
            Ok(Arc::new(GossipCounter::start(config).await?))
        }
    }
}
