//! Circuit breaker guarding the external extraction service.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N consecutive failures]--> OPEN --[open_duration]--> HALF_OPEN (one trial)
//!   ^                                   ^                              |
//!   |                                   +---------[trial fails]--------+
//!   +-------------------------------[trial succeeds]-------------------+
//! ```
//!
//! State is process-local. Every worker process detects a failing
//! dependency on its own.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Cooldown elapsed - the next call is let through as a trial.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call is allowed.
    pub open_duration: Duration,

    /// When a rate limit (429) trips the circuit, multiply open_duration by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Upper bound for the open duration after rate limit backoffs.
    pub max_open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_open_duration: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_error_message: Option<String>,
    current_open_duration: Duration,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            last_error_message: None,
            current_open_duration: config.open_duration,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejected: 0,
        }
    }

    fn remaining_open(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(t)) => self.current_open_duration.saturating_sub(t.elapsed()),
            _ => Duration::ZERO,
        }
    }
}

/// Read-only snapshot of breaker counters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub last_error: Option<String>,
    /// Time left before a trial call is allowed; `None` unless open.
    pub time_remaining_open: Option<Duration>,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - the wrapped operation was not invoked.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Thread-safe circuit breaker for protecting external API calls.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

/// Releases the half-open trial slot if the trial future is dropped
/// before it reports a result.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock_inner();
            inner.trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_remaining_open =
            (inner.state == CircuitState::Open).then(|| inner.remaining_open());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
            last_error: inner.last_error_message.clone(),
            time_remaining_open,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `CircuitBreakerError::Open` without invoking `operation`
    /// - HalfOpen: the first caller runs as the trial; concurrent callers are rejected
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let is_trial = {
            let mut inner = self.lock_inner();
            self.maybe_transition_to_half_open(&mut inner);

            match inner.state {
                CircuitState::Open => {
                    inner.total_rejected += 1;
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: inner.remaining_open(),
                    });
                }
                CircuitState::HalfOpen if inner.trial_in_flight => {
                    inner.total_rejected += 1;
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    true
                }
                CircuitState::Closed => false,
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            // The dependency answered, it just answered badly.
            Err(e) => self.record_neutral(e),
        }
        guard.armed = false;

        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        inner.total_calls += 1;
        inner.total_successes += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful trial");
                self.close(&mut inner);
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.last_error_message = Some(error.to_string());

        let is_rate_limit = matches!(error, AppError::RateLimitExceeded)
            || matches!(
                error,
                AppError::LlmError {
                    status_code: 429,
                    ..
                }
            );

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    self.open(&mut inner, is_rate_limit);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker trial failed, returning to open state"
                );
                inner.consecutive_failures += 1;
                self.open(&mut inner, is_rate_limit);
            }
            CircuitState::Open => {}
        }
    }

    fn record_neutral(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.last_error_message = Some(error.to_string());
        if inner.state == CircuitState::HalfOpen {
            self.close(&mut inner);
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        self.close(&mut inner);
        inner.last_error_message = None;
    }

    fn open(&self, inner: &mut CircuitBreakerInner, is_rate_limit: bool) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;

        if is_rate_limit {
            inner.current_open_duration = std::cmp::min(
                Duration::from_secs_f32(
                    inner.current_open_duration.as_secs_f32()
                        * self.config.rate_limit_backoff_multiplier,
                ),
                self.config.max_open_duration,
            );
            tracing::info!(
                circuit = %self.name,
                open_secs = inner.current_open_duration.as_secs(),
                "Extended open duration due to rate limit"
            );
        }
    }

    fn close(&self, inner: &mut CircuitBreakerInner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.current_open_duration = self.config.open_duration;
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_open_duration
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }
}
