//! Per-shard circuit breaker.
//!
//! After `failure_threshold` consecutive failures a shard is treated as down
//! for `reset_after`; operations against it fail immediately instead of each
//! waiting out the store timeout. Once the window passes a single probe is let
//! through (half-open) and its outcome decides whether the circuit closes again.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds shared by every shard's breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_after: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_after: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    shard: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(shard: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            shard: shard.into(),
            settings,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether an operation may be sent to the shard right now.
    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.window_elapsed(&inner) {
                    debug!(shard = %self.shard, "Circuit breaker half-open, probing shard");
                    inner.state = CircuitState::HalfOpen;
                    Self::start_probe(&mut inner);
                    true
                } else {
                    false
                }
            }
            // A probe whose caller went away never reports back; after a full
            // window another one is allowed through.
            CircuitState::HalfOpen => {
                if !inner.probe_in_flight || self.window_elapsed(&inner) {
                    Self::start_probe(&mut inner);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn window_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.settings.reset_after)
            .unwrap_or(true)
    }

    fn start_probe(inner: &mut BreakerState) {
        inner.probe_in_flight = true;
        inner.opened_at = Some(Instant::now());
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            debug!(shard = %self.shard, "Circuit breaker closing");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        let reopen = inner.state == CircuitState::HalfOpen;
        let trip = inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.settings.failure_threshold;
        if reopen || trip {
            warn!(
                shard = %self.shard,
                consecutive_failures = inner.consecutive_failures,
                reset_after_secs = self.settings.reset_after.as_secs(),
                "Circuit breaker opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}
