//! Circuit breaker guarding origin writes made by replay workers.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::{duration_millis, Clock};
use crate::config::BreakerConfig;
use crate::error::{GatekeeperError, Result};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the recovery timeout elapses.
    Open,
    /// A limited number of probe calls test whether the origin recovered.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Lock-free circuit breaker. Only consecutive failures trip it.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicUsize,
    opened_at: AtomicI64,
    half_open_calls: AtomicUsize,
    failure_threshold: usize,
    recovery_timeout: i64,
    half_open_max_calls: usize,
    clock: Arc<dyn Clock>,
}

/// Releases a half-open probe slot when the probe finishes.
struct ProbeSlot<'a>(&'a AtomicUsize);

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicUsize::new(0),
            opened_at: AtomicI64::new(0),
            half_open_calls: AtomicUsize::new(0),
            failure_threshold: config.failure_threshold,
            recovery_timeout: duration_millis(config.recovery_timeout()),
            half_open_max_calls: config.half_open_max_calls,
            clock,
        })
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// # Errors
    /// Returns [`GatekeeperError::CircuitOpen`] without running the
    /// operation when the circuit is open or half-open capacity is used up,
    /// otherwise whatever the operation returns.
    pub async fn call<T, Fut, Op>(&self, operation: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnOnce() -> Fut,
    {
        let _slot = self.admit()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn admit(&self) -> Result<Option<ProbeSlot<'_>>> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(None),
                CircuitState::Open => {
                    let elapsed = self.open_for();
                    if elapsed < self.recovery_timeout {
                        return Err(self.open_error(elapsed));
                    }
                    if self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        info!("Replay circuit breaker → half-open");
                    }
                    // Re-evaluate in whatever state the race left behind
                }
                CircuitState::HalfOpen => {
                    let in_flight = self.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if in_flight >= self.half_open_max_calls {
                        self.half_open_calls.fetch_sub(1, Ordering::AcqRel);
                        return Err(self.open_error(self.open_for()));
                    }
                    debug!(
                        in_flight = in_flight + 1,
                        max = self.half_open_max_calls,
                        "Replay circuit breaker probe"
                    );
                    return Ok(Some(ProbeSlot(&self.half_open_calls)));
                }
            }
        }
    }

    fn on_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.failures.store(0, Ordering::Release);
                    info!("Replay circuit breaker → closed");
                }
            }
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        let (from, reason) = match self.state() {
            CircuitState::HalfOpen => (STATE_HALF_OPEN, "probe failed"),
            CircuitState::Closed if failures >= self.failure_threshold => {
                (STATE_CLOSED, "threshold reached")
            }
            _ => return,
        };

        if self
            .state
            .compare_exchange(from, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.opened_at
                .store(self.clock.now_millis(), Ordering::Release);
            if from == STATE_HALF_OPEN {
                warn!(failures, reason, "Replay circuit breaker → open");
            } else {
                error!(
                    failures,
                    threshold = self.failure_threshold,
                    reason,
                    "Replay circuit breaker → open"
                );
            }
        }
    }

    fn open_for(&self) -> i64 {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        self.clock.now_millis().saturating_sub(opened_at).max(0)
    }

    fn open_error(&self, elapsed: i64) -> GatekeeperError {
        GatekeeperError::CircuitOpen {
            failures: self.failures.load(Ordering::Acquire),
            open_for: Duration::from_millis(elapsed as u64),
        }
    }
}
