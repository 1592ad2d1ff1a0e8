//! In-process origin counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::OriginCounter;
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::Result;

/// Expired keys are reclaimed once every this many writes.
const PURGE_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: i64,
}

/// Origin counter held in this process.
///
/// Useful for single-node deployments and as the reference store in tests.
/// Expired keys read as zero and are reclaimed every [`PURGE_EVERY`] writes.
#[derive(Debug)]
pub struct MemoryCounter {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
            clock,
        }
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, entries: &HashMap<String, Entry>, key: &str, now: i64) -> i64 {
        entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value)
            .unwrap_or(0)
    }
}

impl Default for MemoryCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OriginCounter for MemoryCounter {
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            entries.retain(|_, e| e.expires_at > now);
        }

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.value = 0;
        }
        entry.value = entry.value.saturating_add(delta);
        entry.expires_at = now.saturating_add(duration_millis(ttl));
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();
        Ok(self.read(&entries, key, now))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<i64>> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();
        Ok(keys.iter().map(|k| self.read(&entries, k, now)).collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_increment_and_get() {
        let counter = MemoryCounter::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(counter.increment("a", 3, ttl).await.unwrap(), 3);
        assert_eq!(counter.increment("a", 2, ttl).await.unwrap(), 5);
        assert_eq!(counter.get("a").await.unwrap(), 5);
        assert_eq!(counter.get("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_multi_get_preserves_order() {
        let counter = MemoryCounter::new();
        let ttl = Duration::from_secs(60);
        counter.increment("x", 1, ttl).await.unwrap();
        counter.increment("z", 7, ttl).await.unwrap();

        let keys = vec!["z".to_string(), "y".to_string(), "x".to_string()];
        assert_eq!(counter.multi_get(&keys).await.unwrap(), vec![7, 0, 1]);
    }

    #[tokio::test]
    async fn test_keys_expire() {
        let clock = ManualClock::new(0);
        let counter = MemoryCounter::with_clock(Arc::new(clock.clone()));

        counter.increment("k", 4, Duration::from_secs(10)).await.unwrap();
        assert_eq!(counter.len(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(counter.get("k").await.unwrap(), 0);
        assert!(counter.is_empty());

        // Expired values do not leak into a fresh increment
        assert_eq!(counter.increment("k", 1, Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_keys_purged_in_batches() {
        let clock = ManualClock::new(0);
        let counter = MemoryCounter::with_clock(Arc::new(clock.clone()));
        let ttl = Duration::from_secs(10);

        for i in 0..10 {
            counter.increment(&format!("old-{}", i), 1, ttl).await.unwrap();
        }
        clock.advance(ttl);

        // Writes between purges leave expired keys in place
        counter.increment("fresh", 1, ttl).await.unwrap();
        assert_eq!(counter.entries.lock().len(), 11);
        assert_eq!(counter.len(), 1);

        for _ in 12..PURGE_EVERY {
            counter.increment("fresh", 1, ttl).await.unwrap();
        }
        assert_eq!(counter.entries.lock().len(), 11);

        counter.increment("fresh", 1, ttl).await.unwrap();
        assert_eq!(counter.entries.lock().len(), 1);
        assert_eq!(counter.get("fresh").await.unwrap(), (PURGE_EVERY - 10) as i64);
    }

    #[tokio::test]
    async fn test_increment_saturates() {
        let counter = MemoryCounter::new();
        let ttl = Duration::from_secs(60);

        counter.increment("k", 5, ttl).await.unwrap();
        assert_eq!(counter.increment("k", i64::MAX, ttl).await.unwrap(), i64::MAX);
    }
}
