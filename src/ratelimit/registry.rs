//! Bucket registry and eviction sweep.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::request::BucketKey;
use super::window::{BucketState, Window};

/// In-memory state for one `(name, identifier, limit, duration)` dimension.
#[derive(Debug)]
pub struct Bucket {
    key: BucketKey,
    /// Window length in milliseconds
    duration: i64,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(key: BucketKey, duration: i64) -> Self {
        Self {
            key,
            duration,
            state: Mutex::new(BucketState::default()),
        }
    }

    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// Exclusive access to the bucket's windows.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, BucketState> {
        self.state.lock()
    }
}

/// Counters of one bucket as seen by [`BucketRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub key: String,
    pub windows: Vec<Window>,
}

/// What one eviction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub windows_evicted: u64,
    pub buckets_evicted: u64,
    pub live_buckets: usize,
    pub live_windows: usize,
}

/// Shared map of live buckets.
///
/// The map's own shard locks cover get-or-create and removal only; window
/// state is guarded by each bucket's lock, so unrelated buckets never wait
/// on each other.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: DashMap<BucketKey, Arc<Bucket>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the bucket for `key`, creating it on first reference.
    /// The flag is true when this call created it.
    pub fn get_or_create(&self, key: &BucketKey, duration: i64) -> (Arc<Bucket>, bool) {
        if let Some(bucket) = self.buckets.get(key) {
            return (bucket.value().clone(), false);
        }

        let mut created = false;
        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                debug!(key = %key, duration_ms = duration, "Creating new rate limit bucket");
                Arc::new(Bucket::new(key.clone(), duration))
            })
            .value()
            .clone();
        (bucket, created)
    }

    pub fn get(&self, key: &BucketKey) -> Option<Arc<Bucket>> {
        self.buckets.get(key).map(|b| b.value().clone())
    }

    /// Get the number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop stale windows everywhere, then buckets left with nothing in them.
    ///
    /// A removed bucket is flagged evicted under its own lock so a request
    /// that resolved it just before removal retries against the registry.
    pub fn sweep(&self, now: i64, grace: i64) -> SweepStats {
        let mut stats = SweepStats::default();

        self.buckets.retain(|key, bucket| {
            let mut state = bucket.lock();
            stats.windows_evicted += state.evict_stale(now, grace);

            if state.is_idle(now) {
                state.mark_evicted();
                stats.buckets_evicted += 1;
                trace!(key = %key, "Evicting idle rate limit bucket");
                return false;
            }

            stats.live_windows += state.window_count();
            true
        });

        stats.live_buckets = self.buckets.len();
        stats
    }

    /// Every bucket's window counters, ordered by key.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let mut snapshot: Vec<BucketSnapshot> = self
            .buckets
            .iter()
            .map(|entry| {
                let state = entry.value().lock();
                BucketSnapshot {
                    key: entry.key().to_string(),
                    windows: state.windows().cloned().collect(),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }
}
