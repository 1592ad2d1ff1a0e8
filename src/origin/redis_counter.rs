//! Redis-backed origin counter.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use tracing::{debug, info};

use super::OriginCounter;
use crate::error::{GatekeeperError, Result};

/// Origin counter stored in Redis.
///
/// Every node talks to the same Redis deployment; `INCRBY` gives the atomic
/// increment and keys expire on their own once their window is long gone.
#[derive(Clone)]
pub struct RedisCounter {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounter")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisCounter {
    /// Open a multiplexed connection to `url`.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        info!(url = %url, key_prefix = %key_prefix, "Connecting to redis origin");
        let client = RedisClient::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        prefixed_key(&self.key_prefix, key)
    }
}

fn prefixed_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

/// Interpret a raw `GET`/`MGET` reply as a counter.
fn parse_counter(key: &str, raw: Option<String>) -> Result<i64> {
    match raw {
        None => Ok(0),
        Some(value) => value.trim().parse::<i64>().map_err(|_| {
            GatekeeperError::MalformedOriginResponse(format!(
                "key {} holds non-integer value {:?}",
                key, value
            ))
        }),
    }
}

#[async_trait]
impl OriginCounter for RedisCounter {
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let key = self.prefixed(key);
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();

        let (total,): (i64,) = redis::pipe()
            .atomic()
            .incr(&key, delta)
            .expire(&key, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, delta = delta, total = total, "Incremented origin counter");
        Ok(total)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let key = self.prefixed(key);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await?;
        parse_counter(&key, raw)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<i64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed(k)).collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&prefixed)
            .query_async(&mut conn)
            .await?;

        if raw.len() != prefixed.len() {
            return Err(GatekeeperError::MalformedOriginResponse(format!(
                "MGET returned {} values for {} keys",
                raw.len(),
                prefixed.len()
            )));
        }

        prefixed
            .iter()
            .zip(raw)
            .map(|(key, value)| parse_counter(key, value))
            .collect()
    }

    async fn close(&self) -> Result<()> {
        // The multiplexed connection shuts down once the last clone is dropped.
        info!(key_prefix = %self.key_prefix, "Closing redis origin");
        Ok(())
    }
}
