//! Adaptive threshold tuning.
//!
//! Optional per-breaker policy that periodically nudges the consecutive
//! failure limit and the recovery timeout toward targets derived from the
//! recent call window. Adjustments are damped (old/new blend) to avoid
//! oscillation, and always clamped inside configured bounds. The blend and
//! multiplier values are policy knobs, not a validated control law.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning policy for one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptivePolicy {
    /// Recompute after this many recorded calls.
    pub retune_interval_calls: u64,

    /// Weight kept on the previous value when blending (damping).
    pub blend: f64,

    /// Lower bound for the tuned failure threshold.
    pub min_failure_threshold: u32,

    /// Upper bound for the tuned failure threshold.
    pub max_failure_threshold: u32,

    /// Lower bound for the tuned recovery timeout.
    #[serde(with = "humantime_serde")]
    pub min_recovery_timeout: Duration,

    /// Upper bound for the tuned recovery timeout.
    #[serde(with = "humantime_serde")]
    pub max_recovery_timeout: Duration,

    /// Maps recent average call latency to a recovery timeout target.
    pub latency_multiplier: f64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            retune_interval_calls: 50,
            blend: 0.8,
            min_failure_threshold: 2,
            max_failure_threshold: 20,
            min_recovery_timeout: Duration::from_secs(10),
            max_recovery_timeout: Duration::from_secs(300),
            latency_multiplier: 20.0,
        }
    }
}

/// Aggregates over the breaker's recent call window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub calls: usize,
    pub error_rate: f64,
    pub avg_latency: Duration,
}

/// Recompute `(failure_threshold, recovery_timeout)` from window stats.
///
/// Low error rate pulls the failure threshold toward its minimum (trip
/// sooner while things are calm); high error rate raises it toward the
/// maximum. The recovery timeout tracks recent average latency. Both moves
/// are blended against the current values and clamped.
pub fn recompute(
    policy: &AdaptivePolicy,
    current_threshold: u32,
    current_recovery: Duration,
    stats: &WindowStats,
) -> (u32, Duration) {
    if stats.calls == 0 {
        return (current_threshold, current_recovery);
    }

    let rate = stats.error_rate.clamp(0.0, 1.0);
    let span = policy.max_failure_threshold.saturating_sub(policy.min_failure_threshold);
    let target_threshold = policy.min_failure_threshold as f64 + rate * span as f64;
    let blended_threshold =
        policy.blend * current_threshold as f64 + (1.0 - policy.blend) * target_threshold;
    let new_threshold = (blended_threshold.round() as u32)
        .clamp(policy.min_failure_threshold, policy.max_failure_threshold);

    let target_recovery = stats.avg_latency.as_secs_f64() * policy.latency_multiplier;
    let blended_recovery =
        policy.blend * current_recovery.as_secs_f64() + (1.0 - policy.blend) * target_recovery;
    let new_recovery = Duration::from_secs_f64(blended_recovery.clamp(
        policy.min_recovery_timeout.as_secs_f64(),
        policy.max_recovery_timeout.as_secs_f64(),
    ));

    (new_threshold, new_recovery)
}
