//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Orchestration-level failures (cycle,
//! init, restore) are distinct variants so callers can branch on severity.

use std::time::Duration;
use thiserror::Error;

use crate::breaker::CircuitState;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the steward orchestrator.
#[derive(Error, Debug)]
pub enum Error {
    /// Dependency cycle detected at verification time. Fatal at startup;
    /// no component init is invoked.
    #[error("dependency cycle: {}", members.join(" -> "))]
    DependencyCycle { members: Vec<String> },

    /// Component failed to initialize. Isolated for non-critical
    /// components; aborts startup entirely for critical ones.
    #[error("component init failed: {component}: {reason}")]
    ComponentInit {
        component: String,
        reason: String,
        critical: bool,
    },

    /// Call short-circuited by an open breaker. Expected, caller-visible,
    /// never retried internally. Carries a retry-after hint derived from
    /// the breaker's recovery timeout.
    #[error("circuit open: {component} (state={state}, retry after {}ms)", retry_after.as_millis())]
    CircuitOpen {
        component: String,
        state: CircuitState,
        retry_after: Duration,
    },

    /// Snapshot missing or failed to deserialize during wake. The
    /// component stays Stopped; it is never resumed with partial state.
    #[error("sleep restore failed: {component}: {reason}")]
    SleepRestore { component: String, reason: String },

    /// Alert delivery failure. Logged and discarded by the dispatcher,
    /// never propagated to the triggering call path.
    #[error("alert delivery failed: {0}")]
    AlertDelivery(String),

    /// Validation errors (bad registration, unknown dependency, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Component or snapshot not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Transient: the component is draining ahead of hibernation.
    #[error("component draining: {0}")]
    Draining(String),

    /// Timeout (drain, grace period).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal errors (recovered panics, corrupted bookkeeping).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn draining(msg: impl Into<String>) -> Self {
        Self::Draining(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn component_init(
        component: impl Into<String>,
        reason: impl Into<String>,
        critical: bool,
    ) -> Self {
        Self::ComponentInit {
            component: component.into(),
            reason: reason.into(),
            critical,
        }
    }

    pub fn sleep_restore(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SleepRestore {
            component: component.into(),
            reason: reason.into(),
        }
    }

    pub fn dependency_cycle(members: Vec<String>) -> Self {
        Self::DependencyCycle { members }
    }

    /// True for the fast-fail breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// Retry-after hint for backoff, when one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_members() {
        let err = Error::dependency_cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_circuit_open_carries_retry_hint() {
        let err = Error::CircuitOpen {
            component: "vpn".into(),
            state: CircuitState::Open,
            retry_after: Duration::from_secs(30),
        };
        assert!(err.is_circuit_open());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(err.to_string().contains("vpn"));
    }

    #[test]
    fn test_retry_after_absent_for_other_errors() {
        assert_eq!(Error::not_found("x").retry_after(), None);
    }
}
