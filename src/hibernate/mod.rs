//! Hibernation ("sleep/wake") for idle components.
//!
//! Suspends idle, non-critical components while persisting enough state to
//! resume them without re-initialization cost. `sleep` drains in-flight
//! calls, exports the component's state, and persists a [`Snapshot`]
//! durably before any status change becomes visible. `wake` rebuilds a
//! fresh instance from the snapshot; a missing or corrupt snapshot leaves
//! the component Stopped and flagged for manual intervention, never
//! resumed with partial state.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::alerts::{AlertDispatcher, AlertEvent, AlertKind, AlertSeverity};
use crate::registry::{ComponentState, ComponentStatus, ManagedComponent, RegistryShared};
use crate::types::{Error, Result};

pub mod store;

pub use store::{
    FileSnapshotStore, MemorySnapshotStore, RegistryIndex, Snapshot, SnapshotStore,
};

// =============================================================================
// Configuration
// =============================================================================

/// Hibernation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HibernationConfig {
    /// A Running, non-critical component with no in-flight calls becomes a
    /// candidate after idling this long.
    #[serde(with = "humantime_serde")]
    pub idle_threshold: Duration,

    /// When the memory pressure gauge is at or above this level, the idle
    /// threshold is bypassed during scans.
    pub memory_pressure_threshold: f64,

    /// How long `sleep` waits for in-flight calls to drain before aborting
    /// the hibernation attempt.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Polling interval while draining.
    #[serde(with = "humantime_serde")]
    pub drain_poll_interval: Duration,

    /// Archive consumed snapshots on wake instead of deleting them.
    pub archive_on_wake: bool,
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(300),
            memory_pressure_threshold: 0.85,
            drain_timeout: Duration::from_secs(10),
            drain_poll_interval: Duration::from_millis(20),
            archive_on_wake: true,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one scan cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub examined: usize,
    pub slept: usize,
    pub failed: usize,
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HibernationStats {
    pub sleeps: u64,
    pub wakes: u64,
    pub wake_failures: u64,
}

// =============================================================================
// Manager
// =============================================================================

/// Drives component suspend/resume against the shared registry map.
#[derive(Debug)]
pub struct HibernationManager {
    shared: Arc<RegistryShared>,
    store: Arc<dyn SnapshotStore>,
    config: HibernationConfig,
    alerts: Arc<AlertDispatcher>,
    /// System-wide memory pressure gauge in [0, 1], set by the host.
    memory_pressure: Mutex<f64>,
    sleeps: AtomicU64,
    wakes: AtomicU64,
    wake_failures: AtomicU64,
}

impl HibernationManager {
    pub(crate) fn new(
        shared: Arc<RegistryShared>,
        store: Arc<dyn SnapshotStore>,
        config: HibernationConfig,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        Self {
            shared,
            store,
            config,
            alerts,
            memory_pressure: Mutex::new(0.0),
            sleeps: AtomicU64::new(0),
            wakes: AtomicU64::new(0),
            wake_failures: AtomicU64::new(0),
        }
    }

    /// Suspend one component. Fails without side effects for critical
    /// components, non-Running components, and drains that time out.
    pub async fn sleep(&self, name: &str, reason: &str) -> Result<()> {
        let cell = self.shared.get(name)?;
        if cell.descriptor.is_critical {
            return Err(Error::validation(format!(
                "critical component cannot be hibernated: {name}"
            )));
        }

        let _guard = cell.hibernate_lock.lock().await;
        let status = cell.status();
        if status != ComponentStatus::Running {
            return Err(Error::state_transition(format!(
                "cannot sleep {name}: status is {status:?}"
            )));
        }

        // Close the gate: new invokes get a transient draining error while
        // existing calls run down.
        cell.draining.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.drain_timeout;
        while cell.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                cell.draining.store(false, Ordering::SeqCst);
                return Err(Error::timeout(format!(
                    "drain timed out for {name}; component stays running"
                )));
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        let result = self.capture_and_persist(&cell, name, reason).await;
        cell.draining.store(false, Ordering::SeqCst);
        result
    }

    /// Resume one component from its snapshot. Waking an already-Running
    /// component succeeds as a no-op (racing implicit wakes).
    pub async fn wake(&self, name: &str) -> Result<()> {
        let cell = self.shared.get(name)?;
        let _guard = cell.hibernate_lock.lock().await;
        match cell.status() {
            ComponentStatus::Running => return Ok(()),
            ComponentStatus::Sleeping => {}
            other => {
                return Err(Error::state_transition(format!(
                    "cannot wake {name}: status is {other:?}"
                )))
            }
        }

        let snapshot = match self.store.load(name) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return self.fail_restore(&cell, name, "snapshot missing"),
            Err(err) => {
                return self.fail_restore(&cell, name, &format!("snapshot unreadable: {err}"))
            }
        };
        let serialized = match &snapshot.serialized_state_ref {
            Some(state_ref) => match self.store.load_state_artifact(state_ref) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    return self.fail_restore(
                        &cell,
                        name,
                        &format!("state artifact unreadable: {err}"),
                    )
                }
            },
            None => None,
        };

        // Fresh instance, restored state, no re-init.
        let mut instance = (cell.factory)();
        let state = ComponentState {
            config: snapshot.config.clone(),
            stats: snapshot.stats.clone(),
            serialized,
        };
        if let Err(err) = instance.import_state(state) {
            return self.fail_restore(&cell, name, &format!("state import failed: {err}"));
        }

        *cell.instance.write().await = Some(instance);
        cell.set_status(ComponentStatus::Running)?;
        *lock(&cell.slept_at) = None;
        cell.touch();
        self.wakes.fetch_add(1, Ordering::Relaxed);

        let cleanup = if self.config.archive_on_wake {
            self.store.archive(name)
        } else {
            self.store.delete(name)
        };
        if let Err(err) = cleanup {
            tracing::warn!("snapshot_cleanup_failed: component={}, error={}", name, err);
        }

        self.shared.persist_index(self.store.as_ref());
        self.alerts.notify(AlertEvent::new(
            AlertKind::ComponentWoken,
            name,
            AlertSeverity::Info,
            format!("component {name} woken"),
        ));
        tracing::info!("component_woken: component={}", name);
        Ok(())
    }

    /// One pass over the registry: suspend every candidate. A candidate is
    /// Running, non-critical, has no in-flight calls, and is idle beyond
    /// the threshold (or the memory pressure gauge is over its limit).
    pub async fn scan(&self) -> ScanReport {
        let over_pressure = self.memory_pressure() >= self.config.memory_pressure_threshold;
        let mut report = ScanReport::default();

        let mut candidates = Vec::new();
        for cell in self.shared.all() {
            report.examined += 1;
            if cell.status() != ComponentStatus::Running || cell.descriptor.is_critical {
                continue;
            }
            if cell.in_flight.load(Ordering::SeqCst) > 0 {
                continue;
            }
            if !over_pressure && cell.idle_for() < self.config.idle_threshold {
                continue;
            }
            candidates.push(cell.descriptor.name.clone());
        }

        let reason = if over_pressure { "memory-pressure" } else { "idle" };
        for name in candidates {
            match self.sleep(&name, reason).await {
                Ok(()) => report.slept += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::debug!("scan_sleep_skipped: component={}, error={}", name, err);
                }
            }
        }

        report.completed_at = Some(Utc::now());
        if report.slept > 0 {
            tracing::info!(
                "hibernation_scan: examined={}, slept={}, failed={}, reason={}",
                report.examined,
                report.slept,
                report.failed,
                reason,
            );
        }
        report
    }

    /// Read a component's snapshot without consuming it.
    pub fn peek(&self, name: &str) -> Result<Option<Snapshot>> {
        self.store.load(name)
    }

    /// Update the memory pressure gauge (host-supplied, [0, 1]).
    pub fn set_memory_pressure(&self, value: f64) {
        *lock(&self.memory_pressure) = value.clamp(0.0, 1.0);
    }

    pub fn memory_pressure(&self) -> f64 {
        *lock(&self.memory_pressure)
    }

    pub fn stats(&self) -> HibernationStats {
        HibernationStats {
            sleeps: self.sleeps.load(Ordering::Relaxed),
            wakes: self.wakes.load(Ordering::Relaxed),
            wake_failures: self.wake_failures.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Internal
    // =========================================================================

    async fn capture_and_persist(
        &self,
        cell: &Arc<ManagedComponent>,
        name: &str,
        reason: &str,
    ) -> Result<()> {
        let state = {
            let guard = cell.instance.read().await;
            let instance = guard
                .as_ref()
                .ok_or_else(|| Error::internal(format!("component instance missing: {name}")))?;
            instance.export_state()
        };
        let ComponentState {
            config,
            stats,
            serialized,
        } = state;

        let mut snapshot = Snapshot {
            component_name: name.to_string(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            previous_status: ComponentStatus::Running,
            config,
            stats,
            is_critical: false,
            serialized_state_ref: None,
        };
        if cell.descriptor.is_stateful {
            match serialized {
                Some(bytes) => {
                    snapshot.serialized_state_ref =
                        Some(self.store.save_state_artifact(name, &bytes)?);
                }
                None => {
                    tracing::warn!("stateful_component_exported_no_state: component={}", name);
                }
            }
        }

        // The snapshot must be durable before the status change is
        // visible; a failed write leaves the component Running.
        self.store.save(&snapshot)?;

        cell.set_status(ComponentStatus::Sleeping)?;
        *cell.instance.write().await = None;
        *lock(&cell.slept_at) = Some(snapshot.timestamp);
        self.sleeps.fetch_add(1, Ordering::Relaxed);

        self.shared.persist_index(self.store.as_ref());
        self.alerts.notify(AlertEvent::new(
            AlertKind::ComponentSlept,
            name,
            AlertSeverity::Info,
            format!("component {name} hibernated: {reason}"),
        ));
        tracing::info!("component_slept: component={}, reason={}", name, reason);
        Ok(())
    }

    /// Failed restore: the component stays Stopped and is flagged for
    /// manual intervention.
    fn fail_restore(&self, cell: &Arc<ManagedComponent>, name: &str, reason: &str) -> Result<()> {
        let _ = cell.set_status(ComponentStatus::Stopped);
        cell.needs_attention.store(true, Ordering::SeqCst);
        self.wake_failures.fetch_add(1, Ordering::Relaxed);
        self.shared.persist_index(self.store.as_ref());
        self.alerts.notify(AlertEvent::new(
            AlertKind::WakeFailed,
            name,
            AlertSeverity::Critical,
            reason,
        ));
        tracing::error!("wake_failed: component={}, reason={}", name, reason);
        Err(Error::sleep_restore(name, reason))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Component, ComponentDescriptor, LifecycleRegistry};
    use crate::types::OrchestratorConfig;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::AtomicUsize;

    /// Stateful-capable test component. Counts inits so tests can assert
    /// that wake restores without re-initialization.
    struct Cache {
        config: Map<String, Value>,
        stats: Map<String, Value>,
        weights: Option<Vec<u8>>,
        init_count: Arc<AtomicUsize>,
        call_delay: Duration,
    }

    #[async_trait]
    impl Component for Cache {
        async fn init(&mut self, config: &Value) -> Result<()> {
            self.init_count.fetch_add(1, Ordering::SeqCst);
            if let Value::Object(map) = config {
                self.config = map.clone();
            }
            self.weights = Some(vec![1, 2, 3]);
            Ok(())
        }

        async fn call(&self, args: Value) -> Result<Value> {
            if !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }
            Ok(json!({ "ok": args }))
        }

        fn export_state(&self) -> ComponentState {
            ComponentState {
                config: self.config.clone(),
                stats: self.stats.clone(),
                serialized: self.weights.clone(),
            }
        }

        fn import_state(&mut self, state: ComponentState) -> Result<()> {
            self.config = state.config;
            self.stats = state.stats;
            self.weights = state.serialized;
            Ok(())
        }
    }

    struct Harness {
        registry: Arc<LifecycleRegistry>,
        store: Arc<MemorySnapshotStore>,
        init_count: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemorySnapshotStore::new());
        Harness {
            registry: Arc::new(LifecycleRegistry::new(
                OrchestratorConfig::default(),
                store.clone(),
            )),
            store,
            init_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    impl Harness {
        fn add_cache(&self, name: &str, critical: bool, stateful: bool, call_delay: Duration) {
            let init_count = self.init_count.clone();
            let mut descriptor = ComponentDescriptor::new(name, vec![])
                .with_init_config(json!({"x": 1}));
            if critical {
                descriptor = descriptor.critical();
            }
            if stateful {
                descriptor = descriptor.stateful();
            }
            self.registry
                .register(descriptor, move || {
                    Box::new(Cache {
                        config: Map::new(),
                        stats: Map::new(),
                        weights: None,
                        init_count: init_count.clone(),
                        call_delay,
                    })
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sleep_critical_is_rejected_without_state_change() {
        let h = harness();
        h.add_cache("critical-db", true, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();

        let err = h.registry.sleep("critical-db", "test").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            h.registry.status("critical-db").unwrap(),
            ComponentStatus::Running
        );
        assert_eq!(h.store.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_sleep_wake_roundtrip_preserves_state() {
        let h = harness();
        h.add_cache("cache", false, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();

        let before = h.registry.info("cache").await.unwrap();
        h.registry.sleep("cache", "idle").await.unwrap();
        assert_eq!(
            h.registry.status("cache").unwrap(),
            ComponentStatus::Sleeping
        );
        // Snapshot visible while sleeping.
        let sleeping = h.registry.info("cache").await.unwrap();
        assert_eq!(sleeping.config, before.config);

        h.registry.wake("cache").await.unwrap();
        assert_eq!(
            h.registry.status("cache").unwrap(),
            ComponentStatus::Running
        );
        let after = h.registry.info("cache").await.unwrap();
        assert_eq!(after.config, before.config);
        assert_eq!(after.stats, before.stats);
        // Restored, not re-initialized.
        assert_eq!(h.init_count.load(Ordering::SeqCst), 1);
        // Consumed snapshot was archived.
        assert_eq!(h.store.snapshot_count(), 0);
        assert_eq!(h.store.archived_count(), 1);
    }

    #[tokio::test]
    async fn test_stateful_component_roundtrips_artifact() {
        let h = harness();
        h.add_cache("model", false, true, Duration::ZERO);
        h.registry.start_all().await.unwrap();

        h.registry.sleep("model", "idle").await.unwrap();
        let snapshot = h
            .registry
            .hibernation()
            .peek("model")
            .unwrap()
            .unwrap();
        assert!(snapshot.serialized_state_ref.is_some());
        assert!(!snapshot.is_critical);

        h.registry.wake("model").await.unwrap();
        // Weights came back through the artifact, not through init.
        let result = h.registry.invoke("model", json!("ping")).await.unwrap();
        assert_eq!(result["ok"], "ping");
        assert_eq!(h.init_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wake_missing_snapshot_leaves_stopped() {
        let h = harness();
        h.add_cache("cache", false, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();
        h.registry.sleep("cache", "idle").await.unwrap();

        // Snapshot disappears out from under us.
        h.store.delete("cache").unwrap();

        let err = h.registry.wake("cache").await.unwrap_err();
        assert!(matches!(err, Error::SleepRestore { .. }));
        assert_eq!(
            h.registry.status("cache").unwrap(),
            ComponentStatus::Stopped
        );
        let info = h.registry.info("cache").await.unwrap();
        assert!(info.needs_attention);
        assert_eq!(h.registry.hibernation().stats().wake_failures, 1);
    }

    #[tokio::test]
    async fn test_invoke_triggers_implicit_wake() {
        let h = harness();
        h.add_cache("cache", false, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();
        h.registry.sleep("cache", "idle").await.unwrap();

        // Caller does not need to wake explicitly.
        let result = h.registry.invoke("cache", json!(7)).await.unwrap();
        assert_eq!(result["ok"], 7);
        assert_eq!(
            h.registry.status("cache").unwrap(),
            ComponentStatus::Running
        );
    }

    #[tokio::test]
    async fn test_wake_running_is_noop() {
        let h = harness();
        h.add_cache("cache", false, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();
        h.registry.wake("cache").await.unwrap();
        assert_eq!(h.registry.hibernation().stats().wakes, 0);
    }

    #[tokio::test]
    async fn test_sleep_non_running_rejected() {
        let h = harness();
        h.add_cache("cache", false, false, Duration::ZERO);
        let err = h.registry.sleep("cache", "idle").await.unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_timeout_aborts_sleep() {
        let store: Arc<MemorySnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let config = OrchestratorConfig {
            hibernation: HibernationConfig {
                drain_timeout: Duration::from_millis(50),
                drain_poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = Arc::new(LifecycleRegistry::new(config, store.clone()));
        let init_count = Arc::new(AtomicUsize::new(0));
        let counter = init_count.clone();
        registry
            .register(ComponentDescriptor::new("slow", vec![]), move || {
                Box::new(Cache {
                    config: Map::new(),
                    stats: Map::new(),
                    weights: None,
                    init_count: counter.clone(),
                    call_delay: Duration::from_millis(300),
                })
            })
            .unwrap();
        registry.start_all().await.unwrap();

        let invoker = registry.clone();
        let call = tokio::spawn(async move { invoker.invoke("slow", json!(null)).await });
        // Let the call get in flight.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = registry.sleep("slow", "idle").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // Aborted hibernation leaves the component running and the
        // in-flight call unharmed.
        assert_eq!(registry.status("slow").unwrap(), ComponentStatus::Running);
        assert!(call.await.unwrap().is_ok());
        assert_eq!(store.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_sleeps_idle_noncritical_only() {
        let store: Arc<MemorySnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let config = OrchestratorConfig {
            hibernation: HibernationConfig {
                idle_threshold: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = Arc::new(LifecycleRegistry::new(config, store.clone()));
        let init_count = Arc::new(AtomicUsize::new(0));
        for (name, critical) in [("idle-a", false), ("idle-b", false), ("core", true)] {
            let counter = init_count.clone();
            let mut descriptor = ComponentDescriptor::new(name, vec![]);
            if critical {
                descriptor = descriptor.critical();
            }
            registry
                .register(descriptor, move || {
                    Box::new(Cache {
                        config: Map::new(),
                        stats: Map::new(),
                        weights: None,
                        init_count: counter.clone(),
                        call_delay: Duration::ZERO,
                    })
                })
                .unwrap();
        }
        registry.start_all().await.unwrap();

        let report = registry.hibernation().scan().await;
        assert_eq!(report.examined, 3);
        assert_eq!(report.slept, 2);
        assert_eq!(registry.status("idle-a").unwrap(), ComponentStatus::Sleeping);
        assert_eq!(registry.status("idle-b").unwrap(), ComponentStatus::Sleeping);
        assert_eq!(registry.status("core").unwrap(), ComponentStatus::Running);

        // A critical component is never observed sleeping; its snapshot
        // never exists.
        assert!(store.load("core").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_respects_idle_threshold() {
        let h = harness();
        h.add_cache("busy", false, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();

        // Default threshold is 5 minutes; a freshly-started component is
        // not a candidate.
        let report = h.registry.hibernation().scan().await;
        assert_eq!(report.slept, 0);
        assert_eq!(h.registry.status("busy").unwrap(), ComponentStatus::Running);
    }

    #[tokio::test]
    async fn test_memory_pressure_bypasses_idle_threshold() {
        let h = harness();
        h.add_cache("cache", false, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();

        let hibernation = h.registry.hibernation();
        hibernation.set_memory_pressure(0.95);
        let report = hibernation.scan().await;
        assert_eq!(report.slept, 1);
        assert_eq!(
            h.registry.status("cache").unwrap(),
            ComponentStatus::Sleeping
        );
    }

    #[tokio::test]
    async fn test_index_reflects_sleep_state() {
        let h = harness();
        h.add_cache("cache", false, false, Duration::ZERO);
        h.registry.start_all().await.unwrap();
        h.registry.sleep("cache", "idle").await.unwrap();

        let index = h.store.load_index().unwrap().unwrap();
        let entry = &index.components["cache"];
        assert_eq!(entry.status, ComponentStatus::Sleeping);
        assert!(entry.sleep_time.is_some());
        assert_eq!(index.statistics.sleeping, 1);
        assert_eq!(index.statistics.active, 0);
    }
}
