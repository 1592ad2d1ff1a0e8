//! Core rate limit service.
//!
//! Decisions are made against in-memory sliding windows. The origin counter
//! is read only when local windows are new or the bucket is in its strict
//! period after a denial, and granted cost reaches the origin asynchronously
//! through the replay queue.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};

use super::breaker::CircuitBreaker;
use super::registry::{Bucket, BucketRegistry, BucketSnapshot, SweepStats};
use super::replay::{self, ReplayContext, ReplayEvent, ReplayQueue};
use super::request::{BucketKey, RatelimitRequest, RatelimitResponse};
use super::window::{calculate_rate_limit, sequence_for, BucketState, Evaluation, Window};
use crate::clock::{duration_millis, to_datetime, Clock, SystemClock};
use crate::config::{BreakerConfig, ServiceConfig};
use crate::error::{GatekeeperError, Result};
use crate::metrics::{DecisionSource, Metrics};
use crate::origin::OriginCounter;

/// The sliding window rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// It must be created inside a Tokio runtime; replay workers and the
/// eviction sweep run as background tasks until [`Service::close`].
pub struct Service {
    registry: Arc<BucketRegistry>,
    origin: Arc<dyn OriginCounter>,
    replay: ReplayQueue,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    config: ServiceConfig,
    background: Mutex<Option<Background>>,
}

struct Background {
    workers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Builder for [`Service`].
pub struct ServiceBuilder {
    origin: Arc<dyn OriginCounter>,
    config: ServiceConfig,
    breaker: BreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl ServiceBuilder {
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the service and its background tasks.
    pub fn build(self) -> Result<Service> {
        self.config.validate()?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::unregistered()?),
        };
        let breaker = Arc::new(CircuitBreaker::new(&self.breaker, self.clock.clone())?);
        let registry = Arc::new(BucketRegistry::new());

        let (replay, receiver) = ReplayQueue::new(self.config.replay_buffer, metrics.clone());
        let workers = replay::spawn_workers(
            self.config.replay_workers,
            receiver,
            ReplayContext {
                origin: self.origin.clone(),
                breaker: breaker.clone(),
                metrics: metrics.clone(),
            },
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_loop(
            registry.clone(),
            self.clock.clone(),
            metrics.clone(),
            self.config.clone(),
            shutdown_rx,
        ));

        info!(
            replay_workers = self.config.replay_workers,
            replay_buffer = self.config.replay_buffer,
            sweep_interval_ms = self.config.sweep_interval_ms,
            "Rate limit service started"
        );

        Ok(Service {
            registry,
            origin: self.origin,
            replay,
            breaker,
            clock: self.clock,
            metrics,
            config: self.config,
            background: Mutex::new(Some(Background {
                workers,
                sweeper,
                shutdown,
            })),
        })
    }
}

/// One validated request and where it lands.
struct Check {
    request: RatelimitRequest,
    key: BucketKey,
    /// Decision time, epoch ms
    time: i64,
    /// Window length, ms
    duration: i64,
}

impl Check {
    fn new(request: RatelimitRequest, now: i64) -> Result<Self> {
        request.validate()?;
        Ok(Self {
            key: request.bucket_key(),
            time: request.time.map(|t| t.timestamp_millis()).unwrap_or(now),
            duration: duration_millis(request.duration),
            request,
        })
    }

    fn sequence(&self) -> i64 {
        sequence_for(self.time, self.duration)
    }
}

/// Buckets of a batch, deduplicated and in lock order.
struct Resolved {
    /// Sorted by canonical bucket key
    ordered: Vec<Arc<Bucket>>,
    /// Index into `ordered` for each check
    slots: Vec<usize>,
}

/// Origin values fetched ahead of a decision.
#[derive(Default)]
struct Refresh {
    /// Window keys the decision wanted from the origin
    requested: HashSet<String>,
    /// Values actually read; empty when the read failed open
    values: HashMap<String, i64>,
}

/// Result of evaluating one check while every lock is held.
struct Outcome {
    eval: Evaluation,
    /// Cost reserved by earlier checks on the same bucket
    pending_before: i64,
    reset: i64,
}

impl Service {
    pub fn builder(origin: Arc<dyn OriginCounter>) -> ServiceBuilder {
        ServiceBuilder {
            origin,
            config: ServiceConfig::default(),
            breaker: BreakerConfig::default(),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Create a service with default settings.
    pub fn new(origin: Arc<dyn OriginCounter>) -> Result<Self> {
        Self::builder(origin).build()
    }

    /// Check a single limit, consuming `cost` when it is admitted.
    pub async fn ratelimit(&self, request: RatelimitRequest) -> Result<RatelimitResponse> {
        self.ratelimit_many(vec![request])
            .await?
            .pop()
            .ok_or_else(|| GatekeeperError::Internal("no response for a single check".into()))
    }

    /// Check several limits at once with all-or-nothing semantics.
    ///
    /// Cost is consumed from every limit only if every limit admits the
    /// request. Responses come back in input order; the batch was granted
    /// iff every response is successful. When the batch is denied, limits
    /// that would have admitted the request report `remaining` as if the
    /// check had not happened.
    #[instrument(level = "debug", skip(self, requests), fields(batch = requests.len()))]
    pub async fn ratelimit_many(
        &self,
        requests: Vec<RatelimitRequest>,
    ) -> Result<Vec<RatelimitResponse>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now_millis();
        let checks = requests
            .into_iter()
            .map(|r| Check::new(r, now))
            .collect::<Result<Vec<_>>>()?;

        loop {
            let resolved = self.resolve(&checks);
            let refresh = self.prefetch(&checks, &resolved).await?;
            if let Some(responses) = self.decide(&checks, &resolved, &refresh) {
                return Ok(responses);
            }
            trace!("Bucket evicted during decision, resolving again");
        }
    }

    /// Resolve or create every bucket the batch touches.
    fn resolve(&self, checks: &[Check]) -> Resolved {
        let mut unique: BTreeMap<BucketKey, Arc<Bucket>> = BTreeMap::new();
        for check in checks {
            if unique.contains_key(&check.key) {
                continue;
            }
            let (bucket, created) = self.registry.get_or_create(&check.key, check.duration);
            if created {
                self.metrics.buckets_created.inc();
                self.metrics.buckets_live.set(self.registry.len() as i64);
            }
            unique.insert(check.key.clone(), bucket);
        }

        let ordered: Vec<Arc<Bucket>> = unique.into_values().collect();
        let slots = checks
            .iter()
            .map(|c| ordered.partition_point(|b| b.key() < &c.key))
            .collect();
        Resolved { ordered, slots }
    }

    /// Read from the origin the windows that cannot be decided locally.
    ///
    /// No bucket lock is held across the origin call. Transport failures and
    /// timeouts fail open; malformed answers are returned as errors.
    async fn prefetch(&self, checks: &[Check], resolved: &Resolved) -> Result<Refresh> {
        let mut refresh = Refresh::default();
        let mut keys = Vec::new();

        for (check, &slot) in checks.iter().zip(&resolved.slots) {
            let targets = resolved.ordered[slot]
                .lock()
                .refresh_targets(check.time, check.duration);
            for sequence in targets {
                let key = check.key.window_key(sequence);
                if refresh.requested.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }

        if keys.is_empty() {
            return Ok(refresh);
        }

        self.metrics.origin_refresh.inc();
        let timeout = self.config.origin_timeout();
        let result = match tokio::time::timeout(timeout, self.origin.multi_get(&keys)).await {
            Ok(result) => result,
            Err(_) => Err(GatekeeperError::OriginTimeout(timeout)),
        };

        match result {
            Ok(values) if values.len() == keys.len() => {
                trace!(keys = keys.len(), "Refreshed windows from origin");
                refresh.values = keys.into_iter().zip(values).collect();
                Ok(refresh)
            }
            Ok(values) => Err(GatekeeperError::MalformedOriginResponse(format!(
                "origin returned {} values for {} keys",
                values.len(),
                keys.len()
            ))),
            Err(e) if e.is_malformed() => Err(e),
            Err(e) => {
                self.metrics.origin_refresh_errors.inc();
                warn!(error = %e, keys = keys.len(), "Origin refresh failed, deciding on local counts");
                Ok(refresh)
            }
        }
    }

    /// Lock every bucket in key order, evaluate, and apply only if all pass.
    ///
    /// Returns `None` when a bucket was evicted after it was resolved.
    fn decide(
        &self,
        checks: &[Check],
        resolved: &Resolved,
        refresh: &Refresh,
    ) -> Option<Vec<RatelimitResponse>> {
        let mut guards: Vec<MutexGuard<'_, BucketState>> =
            resolved.ordered.iter().map(|b| b.lock()).collect();
        if guards.iter().any(|g| g.is_evicted()) {
            return None;
        }

        let mut pending = vec![0i64; guards.len()];
        let mut outcomes = Vec::with_capacity(checks.len());

        for (check, &slot) in checks.iter().zip(&resolved.slots) {
            let state = &mut *guards[slot];
            let (current, previous, source) = self.load_windows(state, check, refresh);

            let eval = calculate_rate_limit(
                check.request.limit,
                check.request.cost,
                pending[slot],
                check.time,
                &current,
                Some(&previous),
            );

            trace!(
                key = %check.key,
                source = source.as_str(),
                effective = eval.effective,
                limit = check.request.limit,
                cost = check.request.cost,
                "Evaluated rate limit"
            );

            if eval.exceeded {
                state.mark_strict(check.time.saturating_add(check.duration));
                debug!(key = %check.key, effective = eval.effective, "Rate limit exceeded");
            }
            self.metrics.record_decision(source, !eval.exceeded);

            outcomes.push(Outcome {
                eval,
                pending_before: pending[slot],
                reset: current.end(),
            });
            if !eval.exceeded {
                pending[slot] = pending[slot].saturating_add(check.request.cost);
            }
        }

        let granted = outcomes.iter().all(|o| !o.eval.exceeded);
        if granted {
            for (check, &slot) in checks.iter().zip(&resolved.slots) {
                self.apply(&mut guards[slot], check);
            }
        }

        let responses = checks
            .iter()
            .zip(outcomes)
            .map(|(check, outcome)| {
                let remaining = if granted || outcome.eval.exceeded {
                    outcome.eval.remaining
                } else {
                    // Never applied: hand back what this evaluation reserved
                    outcome
                        .eval
                        .remaining
                        .saturating_add(check.request.cost)
                        .saturating_add(outcome.pending_before)
                };
                RatelimitResponse {
                    success: !outcome.eval.exceeded,
                    remaining: remaining.max(0),
                    reset: to_datetime(outcome.reset),
                    limit: check.request.limit,
                    current: outcome.eval.effective,
                }
            })
            .collect();

        Some(responses)
    }

    /// Materialize both windows for a check, merging any origin values.
    fn load_windows(
        &self,
        state: &mut BucketState,
        check: &Check,
        refresh: &Refresh,
    ) -> (Window, Window, DecisionSource) {
        let sequence = check.sequence();
        let mut source = DecisionSource::Local;

        let (previous, existed) = state.previous_window(check.time, check.duration);
        self.merge(previous, existed, &check.key, refresh, &mut source);
        let previous = previous.clone();

        let (current, existed) = state.current_window(check.time, check.duration);
        self.merge(current, existed, &check.key, refresh, &mut source);
        let current = current.clone();

        debug_assert_eq!(current.sequence, sequence);
        (current, previous, source)
    }

    fn merge(
        &self,
        window: &mut Window,
        existed: bool,
        key: &BucketKey,
        refresh: &Refresh,
        source: &mut DecisionSource,
    ) {
        if !existed {
            self.metrics.windows_created.inc();
        }

        let window_key = key.window_key(window.sequence);
        if refresh.requested.contains(&window_key) {
            *source = DecisionSource::Origin;
            if let Some(&value) = refresh.values.get(&window_key) {
                window.merge_origin(value);
            }
        }
    }

    /// Consume the check's cost and queue it for the origin.
    fn apply(&self, state: &mut BucketState, check: &Check) {
        let cost = check.request.cost;
        let (window, _) = state.current_window(check.time, check.duration);
        window.counter = window.counter.saturating_add(cost);

        if cost == 0 {
            return;
        }

        let ttl = check
            .request
            .duration
            .saturating_mul(self.config.origin_ttl_windows);
        self.replay.push(ReplayEvent {
            key: check.key.window_key(window.sequence),
            cost,
            ttl,
            span: tracing::Span::current(),
        });
    }

    /// Run one eviction pass now.
    pub fn sweep(&self) -> SweepStats {
        run_sweep(&self.registry, self.clock.as_ref(), &self.metrics, &self.config)
    }

    /// Every bucket's window counters, ordered by bucket key.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        self.registry.snapshot()
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.registry.len()
    }

    /// Replay events waiting for a worker.
    pub fn replay_backlog(&self) -> usize {
        self.replay.len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Stop background work, drain queued replay events into the origin and
    /// close the origin. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        let background = self.background.lock().take();
        let Some(background) = background else {
            return Ok(());
        };

        info!(backlog = self.replay.len(), "Shutting down rate limit service");
        let _ = background.shutdown.send(true);
        self.replay.close();

        for handle in background
            .workers
            .into_iter()
            .chain(std::iter::once(background.sweeper))
        {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.origin.close().await?;
        info!("Rate limit service stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("buckets", &self.registry.len())
            .field("replay_backlog", &self.replay.len())
            .field("config", &self.config)
            .finish()
    }
}

fn run_sweep(
    registry: &BucketRegistry,
    clock: &dyn Clock,
    metrics: &Metrics,
    config: &ServiceConfig,
) -> SweepStats {
    let stats = registry.sweep(
        clock.now_millis(),
        duration_millis(config.eviction_grace()),
    );

    metrics.windows_evicted.inc_by(stats.windows_evicted);
    metrics.buckets_evicted.inc_by(stats.buckets_evicted);
    metrics.buckets_live.set(stats.live_buckets as i64);
    metrics.windows_live.set(stats.live_windows as i64);

    if stats.buckets_evicted > 0 || stats.windows_evicted > 0 {
        debug!(
            buckets_evicted = stats.buckets_evicted,
            windows_evicted = stats.windows_evicted,
            live_buckets = stats.live_buckets,
            "Eviction sweep finished"
        );
    }
    stats
}

async fn sweep_loop(
    registry: Arc<BucketRegistry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    config: ServiceConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = config.sweep_interval();
    let start = tokio::time::Instant::now() + period;
    let mut ticks = IntervalStream::new(tokio::time::interval_at(start, period));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            tick = ticks.next() => {
                if tick.is_none() {
                    break;
                }
                run_sweep(&registry, clock.as_ref(), &metrics, &config);
            }
        }
    }
    trace!("Eviction sweep stopped");
}
