//! Alert dispatch with per-rule rate limiting.
//!
//! The dispatcher observes breaker and lifecycle transitions and emits
//! notifications to pluggable sinks (logging, messaging, dashboards).
//! Alerting is best-effort: events past a rule's cooldown window or hourly
//! cap are counted but not delivered, and sink failures are logged and
//! swallowed. `notify` never blocks or fails the triggering operation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::breaker::CircuitState;
use crate::types::Result;

// =============================================================================
// Configuration
// =============================================================================

/// Rate limiting policy shared by all alert rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Cooldown per rule after a delivered event.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Maximum delivered events per rule per hour.
    pub hourly_cap: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            hourly_cap: 30,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    BreakerOpened,
    BreakerHalfOpen,
    BreakerClosed,
    ComponentStarted,
    ComponentFailed,
    ComponentStopped,
    ComponentSlept,
    ComponentWoken,
    WakeFailed,
}

/// One observed transition, addressed by `(kind, component)`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub component: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        kind: AlertKind,
        component: impl Into<String>,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component: component.into(),
            severity,
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// Build an event from a breaker state change.
    pub fn breaker_transition(component: &str, from: CircuitState, to: CircuitState) -> Self {
        let (kind, severity) = match to {
            CircuitState::Open => (AlertKind::BreakerOpened, AlertSeverity::Warning),
            CircuitState::HalfOpen => (AlertKind::BreakerHalfOpen, AlertSeverity::Info),
            CircuitState::Closed => (AlertKind::BreakerClosed, AlertSeverity::Info),
        };
        Self::new(
            kind,
            component,
            severity,
            format!("breaker {component}: {from} -> {to}"),
        )
    }

    /// Rate-limit key: each distinct rule/event type gets an independent
    /// cooldown window.
    pub fn rule_id(&self) -> String {
        format!("{:?}/{}", self.kind, self.component)
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Delivery target for alerts (logging, messaging, dashboards).
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, event: &AlertEvent) -> Result<()>;
}

/// Default sink: structured log lines, leveled by severity.
#[derive(Debug, Default)]
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<()> {
        match event.severity {
            AlertSeverity::Info => {
                tracing::info!("alert: component={}, kind={:?}, {}", event.component, event.kind, event.message)
            }
            AlertSeverity::Warning => {
                tracing::warn!("alert: component={}, kind={:?}, {}", event.component, event.kind, event.message)
            }
            AlertSeverity::Critical => {
                tracing::error!("alert: component={}, kind={:?}, {}", event.component, event.kind, event.message)
            }
        }
        Ok(())
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Per-rule rate limiting record. Transient, process-memory only.
#[derive(Debug, Default)]
struct AlertRecord {
    cooldown_until: Option<DateTime<Utc>>,
    /// Delivery timestamps within the last hour.
    window: VecDeque<DateTime<Utc>>,
    occurrences: u64,
    suppressed: u64,
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub suppressed: u64,
}

/// Rate-limited, best-effort alert dispatcher.
pub struct AlertDispatcher {
    config: AlertConfig,
    records: Mutex<HashMap<String, AlertRecord>>,
    sinks: Mutex<Vec<Box<dyn AlertSink>>>,
    delivered: AtomicU64,
    suppressed: AtomicU64,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("config", &self.config)
            .field("delivered", &self.delivered)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            sinks: Mutex::new(vec![Box::new(TracingSink)]),
            delivered: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Register an additional delivery target.
    pub fn add_sink(&self, sink: Box<dyn AlertSink>) {
        lock(&self.sinks).push(sink);
    }

    /// Replace all sinks (drops the default tracing sink).
    pub fn set_sinks(&self, sinks: Vec<Box<dyn AlertSink>>) {
        *lock(&self.sinks) = sinks;
    }

    /// Fire-and-forget notification. Never blocks, never fails the caller.
    pub fn notify(&self, event: AlertEvent) {
        let now = Utc::now();
        let rule_id = event.rule_id();
        let hour = ChronoDuration::hours(1);

        let admitted = {
            let mut records = lock(&self.records);
            let record = records.entry(rule_id.clone()).or_default();
            record.occurrences += 1;

            while let Some(&front) = record.window.front() {
                if now - front > hour {
                    record.window.pop_front();
                } else {
                    break;
                }
            }

            let in_cooldown = record.cooldown_until.is_some_and(|until| now < until);
            if in_cooldown || record.window.len() >= self.config.hourly_cap {
                record.suppressed += 1;
                false
            } else {
                record.window.push_back(now);
                record.cooldown_until = Some(
                    now + ChronoDuration::from_std(self.config.cooldown)
                        .unwrap_or_else(|_| ChronoDuration::hours(1)),
                );
                true
            }
        };

        if !admitted {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("alert_suppressed: rule={}", rule_id);
            return;
        }

        self.delivered.fetch_add(1, Ordering::Relaxed);
        for sink in lock(&self.sinks).iter() {
            if let Err(err) = sink.deliver(&event) {
                // Best effort only; the triggering operation must not fail.
                tracing::warn!(
                    "alert_delivery_failed: sink={}, rule={}, error={}",
                    sink.name(),
                    rule_id,
                    err
                );
            }
        }
    }

    /// Drop rate-limit records whose cooldown and hourly window have both
    /// expired. Driven by the supervisor tick.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let hour = ChronoDuration::hours(1);
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, record| {
            let cooling = record.cooldown_until.is_some_and(|until| now < until);
            let windowed = record
                .window
                .back()
                .is_some_and(|&last| now - last <= hour);
            cooling || windowed
        });
        before - records.len()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }

    /// Total observed occurrences for a rule (delivered + suppressed).
    pub fn occurrences(&self, rule_id: &str) -> u64 {
        lock(&self.records)
            .get(rule_id)
            .map(|r| r.occurrences)
            .unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
