//! Prometheus metrics for the rate limit engine.
//!
//! Bring your own `prometheus::Registry`, or use [`Metrics::unregistered`]
//! when nothing scrapes this process.

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::Result;

/// Where a decision's window counts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Local,
    Origin,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Local => "local",
            DecisionSource::Origin => "origin",
        }
    }
}

/// What happened to a replay event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Applied,
    Failed,
    Rejected,
}

impl ReplayOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ReplayOutcome::Applied => "applied",
            ReplayOutcome::Failed => "failed",
            ReplayOutcome::Rejected => "rejected",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub buckets_created: IntCounter,
    pub buckets_evicted: IntCounter,
    pub windows_created: IntCounter,
    pub windows_evicted: IntCounter,
    pub buckets_live: IntGauge,
    pub windows_live: IntGauge,
    decisions: IntCounterVec,
    pub origin_sync_seconds: Histogram,
    pub origin_refresh: IntCounter,
    pub origin_refresh_errors: IntCounter,
    replay: IntCounterVec,
    pub replay_dropped: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("buckets_live", &self.buckets_live.get())
            .field("windows_live", &self.windows_live.get())
            .field("replay_dropped", &self.replay_dropped.get())
            .finish()
    }
}

impl Metrics {
    /// Create the metric set and register it into `registry`.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self> {
        let registry = registry.into();

        let metrics = Self {
            buckets_created: IntCounter::with_opts(opts(
                "buckets_created_total",
                "Rate limit buckets created",
            ))?,
            buckets_evicted: IntCounter::with_opts(opts(
                "buckets_evicted_total",
                "Rate limit buckets evicted by the sweep",
            ))?,
            windows_created: IntCounter::with_opts(opts(
                "windows_created_total",
                "Sliding windows created",
            ))?,
            windows_evicted: IntCounter::with_opts(opts(
                "windows_evicted_total",
                "Sliding windows evicted",
            ))?,
            buckets_live: IntGauge::with_opts(opts("buckets_live", "Buckets held in memory"))?,
            windows_live: IntGauge::with_opts(opts("windows_live", "Windows held in memory at the last sweep"))?,
            decisions: IntCounterVec::new(
                opts("decisions_total", "Rate limit decisions"),
                &["source", "outcome"],
            )?,
            origin_sync_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "origin_sync_seconds",
                    "Latency of replaying granted cost to the origin",
                )
                .namespace("gatekeeper"),
            )?,
            origin_refresh: IntCounter::with_opts(opts(
                "origin_refresh_total",
                "Origin reads made while deciding",
            ))?,
            origin_refresh_errors: IntCounter::with_opts(opts(
                "origin_refresh_errors_total",
                "Origin reads that failed and fell back to local counts",
            ))?,
            replay: IntCounterVec::new(opts("replay_total", "Replay events processed"), &["outcome"])?,
            replay_dropped: IntCounter::with_opts(opts(
                "replay_dropped_total",
                "Replay events dropped because the queue was full or closed",
            ))?,
            registry,
        };

        metrics.register()?;
        Ok(metrics)
    }

    /// Metrics backed by a private registry.
    pub fn unregistered() -> Result<Self> {
        Self::new(Registry::new())
    }

    fn register(&self) -> Result<()> {
        let r = &self.registry;
        r.register(Box::new(self.buckets_created.clone()))?;
        r.register(Box::new(self.buckets_evicted.clone()))?;
        r.register(Box::new(self.windows_created.clone()))?;
        r.register(Box::new(self.windows_evicted.clone()))?;
        r.register(Box::new(self.buckets_live.clone()))?;
        r.register(Box::new(self.windows_live.clone()))?;
        r.register(Box::new(self.decisions.clone()))?;
        r.register(Box::new(self.origin_sync_seconds.clone()))?;
        r.register(Box::new(self.origin_refresh.clone()))?;
        r.register(Box::new(self.origin_refresh_errors.clone()))?;
        r.register(Box::new(self.replay.clone()))?;
        r.register(Box::new(self.replay_dropped.clone()))?;
        Ok(())
    }

    pub fn record_decision(&self, source: DecisionSource, granted: bool) {
        let outcome = if granted { "granted" } else { "denied" };
        self.decisions
            .with_label_values(&[source.as_str(), outcome])
            .inc();
    }

    pub fn decision_count(&self, source: DecisionSource, granted: bool) -> u64 {
        let outcome = if granted { "granted" } else { "denied" };
        self.decisions
            .with_label_values(&[source.as_str(), outcome])
            .get()
    }

    pub fn record_replay(&self, outcome: ReplayOutcome) {
        self.replay.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn replay_count(&self, outcome: ReplayOutcome) -> u64 {
        self.replay.with_label_values(&[outcome.as_str()]).get()
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace("gatekeeper")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions_are_labelled() {
        let metrics = Metrics::unregistered().unwrap();
        metrics.record_decision(DecisionSource::Local, true);
        metrics.record_decision(DecisionSource::Local, true);
        metrics.record_decision(DecisionSource::Origin, false);

        assert_eq!(metrics.decision_count(DecisionSource::Local, true), 2);
        assert_eq!(metrics.decision_count(DecisionSource::Origin, false), 1);
        assert_eq!(metrics.decision_count(DecisionSource::Origin, true), 0);
    }

    #[test]
    fn test_render_contains_namespace() {
        let metrics = Metrics::unregistered().unwrap();
        metrics.buckets_created.inc();
        metrics.record_replay(ReplayOutcome::Applied);

        let text = metrics.render();
        assert!(text.contains("gatekeeper_buckets_created_total 1"));
        assert!(text.contains("gatekeeper_replay_total{outcome=\"applied\"} 1"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        let _first = Metrics::new(registry.clone()).unwrap();
        assert!(Metrics::new(registry).is_err());
    }
}
