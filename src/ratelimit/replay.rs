//! Asynchronous propagation of granted cost to the origin.
//!
//! Granted requests are pushed onto a bounded queue while the bucket lock is
//! still held; a fixed pool of workers drains it and increments the origin
//! through the circuit breaker. A full queue drops events instead of making
//! the request path wait.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

use super::breaker::CircuitBreaker;
use crate::error::GatekeeperError;
use crate::metrics::{Metrics, ReplayOutcome};
use crate::origin::OriginCounter;

/// Cost to apply to one origin window counter.
#[derive(Debug, Clone)]
pub struct ReplayEvent {
    /// Origin key of the window (`bucket key:sequence`)
    pub key: String,
    pub cost: i64,
    /// Expiry to (re)arm on the origin key
    pub ttl: Duration,
    /// Span of the request that was granted
    pub span: tracing::Span,
}

/// Bounded, drop-on-overflow queue of replay events.
#[derive(Debug)]
pub struct ReplayQueue {
    sender: RwLock<Option<mpsc::Sender<ReplayEvent>>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl ReplayQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> (Self, mpsc::Receiver<ReplayEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = Self {
            sender: RwLock::new(Some(sender)),
            capacity,
            metrics,
        };
        (queue, receiver)
    }

    /// Enqueue without waiting. Returns `false` when the event was dropped
    /// because the queue is full or closed.
    pub fn push(&self, event: ReplayEvent) -> bool {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            self.metrics.replay_dropped.inc();
            debug!(key = %event.key, "Replay queue closed, dropping event");
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.metrics.replay_dropped.inc();
                debug!(key = %event.key, cost = event.cost, "Replay queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.metrics.replay_dropped.inc();
                debug!(key = %event.key, "Replay workers gone, dropping event");
                false
            }
        }
    }

    /// Number of events waiting for a worker.
    pub fn len(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|s| self.capacity - s.capacity())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting events. Workers finish what is already queued.
    pub fn close(&self) {
        self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }
}

/// Everything a replay worker needs.
#[derive(Clone)]
pub struct ReplayContext {
    pub origin: Arc<dyn OriginCounter>,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<Metrics>,
}

/// Spawn `count` workers sharing `receiver`. They exit once the queue is
/// closed and drained.
pub fn spawn_workers(
    count: usize,
    receiver: mpsc::Receiver<ReplayEvent>,
    ctx: ReplayContext,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..count)
        .map(|id| tokio::spawn(worker_loop(id, receiver.clone(), ctx.clone())))
        .collect()
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<ReplayEvent>>>,
    ctx: ReplayContext,
) {
    trace!(worker = id, "Replay worker started");
    loop {
        let next = receiver.lock().await.recv().await;
        match next {
            Some(event) => apply(&ctx, event).await,
            None => break,
        }
    }
    trace!(worker = id, "Replay worker stopped");
}

/// Apply one event to the origin through the breaker.
pub async fn apply(ctx: &ReplayContext, event: ReplayEvent) {
    let span = tracing::debug_span!(
        parent: &event.span,
        "replay",
        key = %event.key,
        cost = event.cost
    );

    async {
        let timer = ctx.metrics.origin_sync_seconds.start_timer();
        let result = ctx
            .breaker
            .call(|| ctx.origin.increment(&event.key, event.cost, event.ttl))
            .await;

        match result {
            Ok(total) => {
                timer.observe_duration();
                ctx.metrics.record_replay(ReplayOutcome::Applied);
                trace!(total = total, "Replayed cost to origin");
            }
            Err(GatekeeperError::CircuitOpen { failures, open_for }) => {
                let _ = timer.stop_and_discard();
                ctx.metrics.record_replay(ReplayOutcome::Rejected);
                debug!(failures, open_for = ?open_for, "Replay rejected by open circuit");
            }
            Err(e) => {
                timer.observe_duration();
                ctx.metrics.record_replay(ReplayOutcome::Failed);
                warn!(error = %e, "Failed to replay cost to origin");
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BreakerConfig;
    use crate::error::Result;
    use crate::origin::MemoryCounter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(key: &str, cost: i64) -> ReplayEvent {
        ReplayEvent {
            key: key.to_string(),
            cost,
            ttl: Duration::from_secs(60),
            span: tracing::Span::none(),
        }
    }

    fn context(origin: Arc<dyn OriginCounter>, metrics: Arc<Metrics>) -> ReplayContext {
        let config = BreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 1,
        };
        let breaker = CircuitBreaker::new(&config, Arc::new(ManualClock::new(0))).unwrap();
        ReplayContext {
            origin,
            breaker: Arc::new(breaker),
            metrics,
        }
    }

    /// Origin that fails every call.
    struct DownOrigin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OriginCounter for DownOrigin {
        async fn increment(&self, _key: &str, _delta: i64, _ttl: Duration) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GatekeeperError::OriginUnavailable("connection refused".into()))
        }
        async fn get(&self, _key: &str) -> Result<i64> {
            Err(GatekeeperError::OriginUnavailable("connection refused".into()))
        }
        async fn multi_get(&self, _keys: &[String]) -> Result<Vec<i64>> {
            Err(GatekeeperError::OriginUnavailable("connection refused".into()))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_drops_when_full() {
        let metrics = Arc::new(Metrics::unregistered().unwrap());
        let (queue, _receiver) = ReplayQueue::new(2, metrics.clone());

        assert!(queue.push(event("a", 1)));
        assert!(queue.push(event("b", 1)));
        assert!(!queue.push(event("c", 1)));

        assert_eq!(queue.len(), 2);
        assert_eq!(metrics.replay_dropped.get(), 1);
    }

    #[test]
    fn test_push_after_close_is_dropped() {
        let metrics = Arc::new(Metrics::unregistered().unwrap());
        let (queue, _receiver) = ReplayQueue::new(4, metrics.clone());

        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.push(event("a", 1)));
        assert_eq!(metrics.replay_dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_workers_drain_queue_on_close() {
        let metrics = Arc::new(Metrics::unregistered().unwrap());
        let origin = Arc::new(MemoryCounter::new());
        let (queue, receiver) = ReplayQueue::new(100, metrics.clone());

        for _ in 0..50 {
            assert!(queue.push(event("window", 2)));
        }

        let handles = spawn_workers(4, receiver, context(origin.clone(), metrics.clone()));
        queue.close();
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(origin.get("window").await.unwrap(), 100);
        assert_eq!(metrics.replay_count(ReplayOutcome::Applied), 50);
    }

    #[tokio::test]
    async fn test_breaker_stops_hammering_failed_origin() {
        let metrics = Arc::new(Metrics::unregistered().unwrap());
        let origin = Arc::new(DownOrigin { calls: AtomicUsize::new(0) });
        let ctx = context(origin.clone(), metrics.clone());

        for _ in 0..10 {
            apply(&ctx, event("window", 1)).await;
        }

        // Two failures trip the breaker; the rest fail fast
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.replay_count(ReplayOutcome::Failed), 2);
        assert_eq!(metrics.replay_count(ReplayOutcome::Rejected), 8);
    }
}
