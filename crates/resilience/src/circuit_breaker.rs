//! Circuit breaker state machine.
//!
//! ```text
//!            failure_threshold failures
//!   CLOSED ------------------------------> OPEN
//!     ^                                   |  ^
//!     | success_threshold successes       |  | any failure
//!     |                                   v  |
//!     +---------------------------- HALF_OPEN
//!                (entered on the first call after `timeout`)
//! ```
//!
//! Counters are reset on every transition. All transitions for one breaker
//! happen under a single mutex, so concurrent callers observe them atomically.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as an upper-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds and timeout for one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN that close it.
    pub success_threshold: u32,
    /// How long OPEN lasts before a trial call is let through.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the operation was not attempted.
    #[error("Circuit breaker '{name}' is OPEN; retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// Returns true if the call was short-circuited.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Returns the operation's error, if the operation ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Mutable breaker state, guarded by the breaker's mutex.
#[derive(Debug, Clone)]
struct CircuitBreakerMetrics {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    state_changed_at: Instant,
}

/// Serializable view of a breaker for operators.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure.
    pub last_failure_ms_ago: Option<u64>,
    /// Milliseconds spent in the current state.
    pub in_state_ms: u64,
}

/// A breaker guarding one downstream dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    metrics: Mutex<CircuitBreakerMetrics>,
}

impl CircuitBreaker {
    /// Creates a breaker with default thresholds.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Creates a breaker with explicit thresholds.
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            metrics: Mutex::new(CircuitBreakerMetrics {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                state_changed_at: Instant::now(),
            }),
        }
    }

    /// The dependency name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Does not advance OPEN to HALF_OPEN.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Returns true if calls are currently being short-circuited.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Runs `operation` through the breaker.
    ///
    /// When OPEN and the timeout has not elapsed, the closure is never called.
    #[tracing::instrument(skip(self, operation), fields(dependency = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Operation(e))
            }
        }
    }

    /// Records a failure observed outside [`execute`](Self::execute),
    /// such as a failed health check.
    pub fn record_failure(&self) {
        let mut m = self.lock();
        let now = Instant::now();
        m.last_failure_time = Some(now);

        match m.state {
            CircuitState::Closed => {
                m.failure_count += 1;
                if m.failure_count >= self.config.failure_threshold {
                    self.transition(&mut m, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut m, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Administrative reset to CLOSED.
    pub fn reset(&self) {
        let mut m = self.lock();
        self.transition(&mut m, CircuitState::Closed);
        m.last_failure_time = None;
    }

    /// Snapshot for the admin surface.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let m = self.lock();
        let now = Instant::now();
        BreakerSnapshot {
            name: self.name.clone(),
            state: m.state,
            failure_count: m.failure_count,
            success_count: m.success_count,
            last_failure_ms_ago: m
                .last_failure_time
                .map(|t| now.duration_since(t).as_millis() as u64),
            in_state_ms: now.duration_since(m.state_changed_at).as_millis() as u64,
        }
    }

    fn try_acquire<E>(&self) -> Result<(), BreakerError<E>> {
        let mut m = self.lock();
        if m.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = m.state_changed_at.elapsed();
        if elapsed >= self.config.timeout {
            self.transition(&mut m, CircuitState::HalfOpen);
            return Ok(());
        }

        metrics::counter!("circuit_breaker_rejections_total", "dependency" => self.name.clone())
            .increment(1);
        Err(BreakerError::Open {
            name: self.name.clone(),
            retry_after: self.config.timeout - elapsed,
        })
    }

    fn on_success(&self) {
        let mut m = self.lock();
        match m.state {
            CircuitState::Closed => m.failure_count = 0,
            CircuitState::HalfOpen => {
                m.success_count += 1;
                if m.success_count >= self.config.success_threshold {
                    self.transition(&mut m, CircuitState::Closed);
                }
            }
            // A concurrent trial call already reopened the breaker.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, m: &mut CircuitBreakerMetrics, to: CircuitState) {
        let from = m.state;
        m.state = to;
        m.failure_count = 0;
        m.success_count = 0;
        m.state_changed_at = Instant::now();

        if from == to {
            return;
        }
        match to {
            CircuitState::Open => {
                tracing::warn!(dependency = %self.name, %from, "Circuit breaker opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(dependency = %self.name, "Circuit breaker half-open; trial calls allowed")
            }
            CircuitState::Closed => {
                tracing::info!(dependency = %self.name, %from, "Circuit breaker closed")
            }
        }
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "dependency" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
