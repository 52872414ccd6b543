//! Circuit breaking for component invocation.
//!
//! Per-component adaptive failure isolation. Every call into a component
//! passes through its breaker: once a component is deemed unhealthy the
//! breaker fails fast with [`Error::CircuitOpen`] instead of letting
//! failures cascade.
//!
//! State machine:
//! ```text
//! CLOSED --(open condition met)--> OPEN --(recovery timeout)--> HALF-OPEN
//!    ^                                ^                             |
//!    |                                └──────(any failure)──────────┤
//!    └─────────────(success threshold reached)─────────────────────┘
//! ```
//!
//! State mutation is fully serialized: the owning registry guards each
//! breaker with a single per-component lock, so `try_acquire`/`record_*`
//! never race.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::types::{Error, Result};

pub mod adaptive;

pub use adaptive::{AdaptivePolicy, WindowStats};

// =============================================================================
// Configuration
// =============================================================================

/// Breaker policy (fixed thresholds unless `adaptive` is set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Minimum recorded calls before the open condition is evaluated.
    pub min_calls_for_analysis: usize,

    /// Error rate over the recent window that opens the circuit.
    pub error_rate_threshold: f64,

    /// Consecutive failures that open the circuit. Starting point when
    /// adaptive tuning is enabled.
    pub failure_threshold: u32,

    /// Successes required while half-open before closing.
    pub success_threshold: u32,

    /// Maximum concurrent probe calls admitted while half-open.
    pub half_open_max_calls: u32,

    /// Time the circuit stays open before admitting a probe. Starting
    /// point when adaptive tuning is enabled.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Capacity of the recent-outcome ring.
    pub history_size: usize,

    /// Adaptive threshold tuning; `None` keeps thresholds fixed.
    #[serde(default)]
    pub adaptive: Option<AdaptivePolicy>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_calls_for_analysis: 10,
            error_rate_threshold: 0.5,
            failure_threshold: 5,
            success_threshold: 2,
            half_open_max_calls: 3,
            recovery_timeout: Duration::from_secs(30),
            history_size: 100,
            adaptive: None,
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A state change, reported to the caller so it can be dispatched as an
/// alert event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Single call outcome in the bounded history ring.
#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    success: bool,
    latency: Duration,
}

/// Introspection report (state + window aggregates + live thresholds).
#[derive(Debug, Clone, Serialize)]
pub struct BreakerReport {
    pub component: String,
    pub state: CircuitState,
    pub window_calls: usize,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub times_opened: u64,
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// Adaptive circuit breaker for a single component.
///
/// Lives as long as its component. No terminal state.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: CircuitState,
    history: VecDeque<CallOutcome>,

    // Counters
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    times_opened: u64,
    calls_since_retune: u64,

    // Live thresholds (mutated only by adaptive tuning, inside bounds)
    failure_threshold: u32,
    recovery_timeout: Duration,

    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let failure_threshold = config.failure_threshold;
        let recovery_timeout = config.recovery_timeout;
        Self {
            name: name.into(),
            history: VecDeque::with_capacity(config.history_size),
            config,
            state: CircuitState::Closed,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            times_opened: 0,
            calls_since_retune: 0,
            failure_threshold,
            recovery_timeout,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    /// Wrap a call. Fails fast with [`Error::CircuitOpen`] when the circuit
    /// is open and the recovery timeout has not elapsed; otherwise invokes
    /// `f`, records the outcome, and surfaces `f`'s error unchanged.
    pub fn call<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.try_acquire()?;
        let start = Instant::now();
        match f() {
            Ok(value) => {
                self.record_success(start.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.record_failure(start.elapsed());
                Err(err)
            }
        }
    }

    /// Admission decision for one call. Returns the Open→HalfOpen
    /// transition when this call is the first recovery probe.
    ///
    /// A rejected call is not a recorded outcome: [`Error::CircuitOpen`] is
    /// reported to the caller and never counted in the history ring.
    pub fn try_acquire(&mut self) -> Result<Option<Transition>> {
        match self.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    let transition = self.transition_to(CircuitState::HalfOpen);
                    self.half_open_in_flight = 1;
                    Ok(Some(transition))
                } else {
                    Err(Error::CircuitOpen {
                        component: self.name.clone(),
                        state: CircuitState::Open,
                        retry_after: self.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight < self.config.half_open_max_calls {
                    self.half_open_in_flight += 1;
                    Ok(None)
                } else {
                    Err(Error::CircuitOpen {
                        component: self.name.clone(),
                        state: CircuitState::HalfOpen,
                        retry_after: self.recovery_timeout,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, latency: Duration) -> Option<Transition> {
        self.push_outcome(true, latency);
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(Instant::now());

        let transition = if self.state == CircuitState::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
            self.half_open_successes += 1;
            if self.half_open_successes >= self.config.success_threshold {
                Some(self.transition_to(CircuitState::Closed))
            } else {
                None
            }
        } else {
            None
        };

        self.maybe_retune();
        transition
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, latency: Duration) -> Option<Transition> {
        self.push_outcome(false, latency);
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Instant::now());

        let transition = match self.state {
            // Any half-open failure reopens immediately.
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                Some(self.transition_to(CircuitState::Open))
            }
            CircuitState::Closed if self.open_condition_met() => {
                Some(self.transition_to(CircuitState::Open))
            }
            _ => None,
        };

        self.maybe_retune();
        transition
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current (possibly adaptively tuned) recovery timeout.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Window aggregates feeding adaptive tuning and reports.
    pub fn window_stats(&self) -> WindowStats {
        let calls = self.history.len();
        let avg_latency = if calls == 0 {
            Duration::ZERO
        } else {
            let total: Duration = self.history.iter().map(|o| o.latency).sum();
            total / calls as u32
        };
        WindowStats {
            calls,
            error_rate: self.error_rate(),
            avg_latency,
        }
    }

    pub fn report(&self) -> BreakerReport {
        let stats = self.window_stats();
        BreakerReport {
            component: self.name.clone(),
            state: self.state,
            window_calls: stats.calls,
            success_count: self.success_count,
            failure_count: self.failure_count,
            consecutive_failures: self.consecutive_failures,
            error_rate: stats.error_rate,
            avg_latency_ms: stats.avg_latency.as_secs_f64() * 1000.0,
            failure_threshold: self.failure_threshold,
            recovery_timeout_ms: self.recovery_timeout.as_millis() as u64,
            times_opened: self.times_opened,
        }
    }

    /// Run the damped recompute if the call-count interval has elapsed.
    /// Called inline from the record path and swept by the supervisor.
    pub fn retune_if_due(&mut self) -> bool {
        let Some(policy) = self.config.adaptive.clone() else {
            return false;
        };
        if self.calls_since_retune < policy.retune_interval_calls {
            return false;
        }
        self.retune(&policy);
        true
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn push_outcome(&mut self, success: bool, latency: Duration) {
        if self.history.len() >= self.config.history_size {
            self.history.pop_front();
        }
        self.history.push_back(CallOutcome { success, latency });
    }

    fn error_rate(&self) -> f64 {
        let total = self.history.len();
        if total == 0 {
            // Empty or corrupted history: assume healthy.
            return 0.0;
        }
        let failures = self.history.iter().filter(|o| !o.success).count();
        failures as f64 / total as f64
    }

    fn open_condition_met(&self) -> bool {
        if self.history.len() < self.config.min_calls_for_analysis {
            return false;
        }
        self.error_rate() >= self.config.error_rate_threshold
            || self.consecutive_failures >= self.failure_threshold
    }

    fn transition_to(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        match to {
            CircuitState::Open => {
                self.times_opened += 1;
                tracing::warn!(
                    "breaker_opened: component={}, consecutive_failures={}, error_rate={:.2}",
                    self.name,
                    self.consecutive_failures,
                    self.error_rate(),
                );
            }
            CircuitState::HalfOpen => {
                self.half_open_successes = 0;
                self.half_open_in_flight = 0;
                tracing::info!("breaker_half_open: component={}", self.name);
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.half_open_successes = 0;
                self.half_open_in_flight = 0;
                tracing::info!("breaker_closed: component={}", self.name);
            }
        }
        Transition { from, to }
    }

    fn maybe_retune(&mut self) {
        if self.config.adaptive.is_none() {
            return;
        }
        self.calls_since_retune += 1;
        self.retune_if_due();
    }

    fn retune(&mut self, policy: &AdaptivePolicy) {
        let stats = self.window_stats();
        let (threshold, recovery) =
            adaptive::recompute(policy, self.failure_threshold, self.recovery_timeout, &stats);
        if threshold != self.failure_threshold || recovery != self.recovery_timeout {
            tracing::debug!(
                "breaker_retuned: component={}, failure_threshold={}->{}, recovery_timeout_ms={}->{}",
                self.name,
                self.failure_threshold,
                threshold,
                self.recovery_timeout.as_millis(),
                recovery.as_millis(),
            );
        }
        self.failure_threshold = threshold;
        self.recovery_timeout = recovery;
        self.calls_since_retune = 0;
    }
}

// =============================================================================
// Tests
// =============================================================================
