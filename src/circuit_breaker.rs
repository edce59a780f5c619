//! Circuit breaker guarding a single downstream dependency.
//!
//! The breaker cycles through three states:
//!
//! - **Closed**: calls flow normally and outcomes are counted.
//! - **Open**: calls are rejected immediately without invoking the operation.
//! - **Half-open**: a bounded number of probe calls test whether the
//!   dependency has recovered.
//!
//! ```text
//! CLOSED --(failures >= threshold OR error rate > expected)--> OPEN
//! OPEN --(reset timeout elapsed)--> HALF_OPEN
//! HALF_OPEN --(half_open_max_calls successes)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! The breaker never retries and never hides the wrapped operation's error.

use crate::clock::{Clock, SystemClock};
use crate::error::GuardError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, all calls are allowed through
    Closed,
    /// Failing fast, calls are rejected without executing
    Open,
    /// Testing recovery with a limited number of probe calls
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Tuning parameters for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Failures since the last transition that trip the breaker
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed
    pub reset_timeout_ms: u64,
    /// Length of the window used for the error-rate trip
    pub monitoring_period_ms: u64,
    /// Error rate in `[0, 1]` above which the breaker trips
    pub expected_error_rate: f64,
    /// Probe calls allowed while half-open; that many successes close the circuit
    pub half_open_max_calls: u32,
    /// Outcomes a monitoring window must hold before the error-rate trip applies
    pub minimum_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            monitoring_period_ms: 60_000,
            expected_error_rate: 0.5,
            half_open_max_calls: 3,
            minimum_calls: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.failure_threshold == 0 {
            return Err(GuardError::Configuration(
                "Failure threshold must be greater than 0".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(GuardError::Configuration(
                "Half-open max calls must be greater than 0".to_string(),
            ));
        }
        if self.monitoring_period_ms == 0 {
            return Err(GuardError::Configuration(
                "Monitoring period must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.expected_error_rate) {
            return Err(GuardError::Configuration(format!(
                "Expected error rate must be within [0, 1], got {}",
                self.expected_error_rate
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub error_rate: f64,
}

/// Result of a call made through [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit rejected the call without running the operation.
    #[error("Circuit breaker OPEN for {name}")]
    Open { name: String },

    /// The operation ran and failed; the error is passed through unchanged.
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// The downstream error, if the operation actually ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            CircuitBreakerError::Open { .. } => None,
            CircuitBreakerError::Operation(err) => Some(err),
        }
    }

    /// Convert into a [`GuardError`], mapping the downstream error with `f`.
    pub fn into_guard_error(self, f: impl FnOnce(E) -> GuardError) -> GuardError {
        match self {
            CircuitBreakerError::Open { name } => GuardError::CircuitOpen(name),
            CircuitBreakerError::Operation(err) => f(err),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    last_failure_at: Option<u64>,
    half_open_in_flight: u32,
    /// Bumped on every transition; outcomes from an older generation are dropped.
    generation: u64,
    window_started_at: u64,
    window_failures: u64,
    window_successes: u64,
}

impl BreakerInner {
    fn new(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            half_open_in_flight: 0,
            generation: 0,
            window_started_at: now,
            window_failures: 0,
            window_successes: 0,
        }
    }

    fn clear_counters(&mut self, now: u64) {
        self.failure_count = 0;
        self.success_count = 0;
        self.window_started_at = now;
        self.window_failures = 0;
        self.window_successes = 0;
    }

    fn roll_window(&mut self, now: u64, period_ms: u64) {
        if now.saturating_sub(self.window_started_at) >= period_ms {
            self.window_started_at = now;
            self.window_failures = 0;
            self.window_successes = 0;
        }
    }
}

/// Admission ticket for one call. Dropping an unsettled probe frees its slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.generation == self.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Process-local circuit breaker for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker driven by the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        let now = clock.now_millis();

        debug!(
            name = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout_ms,
            half_open_max_calls = config.half_open_max_calls,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerInner::new(now)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under breaker protection.
    ///
    /// Returns [`CircuitBreakerError::Open`] without invoking the operation
    /// while the circuit is open (or while every half-open probe slot is
    /// taken); such rejections are not counted. Otherwise the operation's
    /// own result is returned, with its error wrapped in
    /// [`CircuitBreakerError::Operation`].
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = match self.acquire() {
            Some(permit) => permit,
            None => {
                debug!(name = %self.name, "Call rejected, circuit open");
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                });
            }
        };

        let result = operation().await;
        self.record(&mut permit, result.is_ok());

        result.map_err(CircuitBreakerError::Operation)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        let total = inner.failure_count + inner.success_count;
        let error_rate = if total == 0 {
            0.0
        } else {
            inner.failure_count as f64 / total as f64
        };

        CircuitStats {
            state: inner.state,
            failures: inner.failure_count,
            successes: inner.success_count,
            error_rate,
        }
    }

    /// Force the circuit closed with zeroed counters.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed, now);
        inner.last_failure_at = None;
    }

    /// Trip the circuit manually.
    pub fn open(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        warn!(name = %self.name, "Circuit breaker forced open");
        self.transition(&mut inner, CircuitState::Open, now);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Option<Permit<'_>> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.roll_window(now, self.config.monitoring_period_ms);
                Some(Permit {
                    breaker: self,
                    generation: inner.generation,
                    probe: false,
                    settled: false,
                })
            }
            CircuitState::Open => {
                let opened_at = inner.last_failure_at.unwrap_or(0);
                if now.saturating_sub(opened_at) < self.config.reset_timeout_ms {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen, now);
                self.admit_probe(&mut inner)
            }
            CircuitState::HalfOpen => self.admit_probe(&mut inner),
        }
    }

    fn admit_probe(&self, inner: &mut BreakerInner) -> Option<Permit<'_>> {
        let used = inner.half_open_in_flight as u64 + inner.success_count;
        if used >= self.config.half_open_max_calls as u64 {
            return None;
        }
        inner.half_open_in_flight += 1;
        Some(Permit {
            breaker: self,
            generation: inner.generation,
            probe: true,
            settled: false,
        })
    }

    fn record(&self, permit: &mut Permit<'_>, success: bool) {
        permit.settled = true;
        let now = self.clock.now_millis();
        let mut inner = self.lock();

        if inner.generation != permit.generation {
            debug!(name = %self.name, success, "Discarding outcome from before a transition");
            return;
        }
        if permit.probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.roll_window(now, self.config.monitoring_period_ms);
                if success {
                    inner.success_count += 1;
                    inner.window_successes += 1;
                } else {
                    inner.failure_count += 1;
                    inner.window_failures += 1;
                    inner.last_failure_at = Some(now);
                    if self.should_trip(&inner) {
                        self.transition(&mut inner, CircuitState::Open, now);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.half_open_max_calls as u64 {
                        self.transition(&mut inner, CircuitState::Closed, now);
                    }
                } else {
                    inner.failure_count += 1;
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        if inner.failure_count >= self.config.failure_threshold as u64 {
            return true;
        }

        let window_total = inner.window_failures + inner.window_successes;
        if window_total == 0 || window_total < self.config.minimum_calls as u64 {
            return false;
        }
        let window_error_rate = inner.window_failures as f64 / window_total as f64;
        window_error_rate > self.config.expected_error_rate
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: u64) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.half_open_in_flight = 0;

        match to {
            CircuitState::Closed => {
                inner.clear_counters(now);
                if from != CircuitState::Closed {
                    info!(name = %self.name, from = %from, "Circuit breaker closed");
                }
            }
            CircuitState::HalfOpen => {
                inner.clear_counters(now);
                info!(
                    name = %self.name,
                    half_open_max_calls = self.config.half_open_max_calls,
                    "Circuit breaker half-open, probing recovery"
                );
            }
            CircuitState::Open => {
                inner.last_failure_at = Some(now);
                warn!(
                    name = %self.name,
                    from = %from,
                    failures = inner.failure_count,
                    successes = inner.success_count,
                    reset_timeout_ms = self.config.reset_timeout_ms,
                    "Circuit breaker opened"
                );
            }
        }
    }
}
