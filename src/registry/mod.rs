//! Lifecycle registry - the single entry point into managed components.
//!
//! The registry owns every descriptor and runtime component cell, drives
//! dependency-ordered startup/shutdown, and routes all traffic through each
//! component's circuit breaker. Subsystems (graph, breaker, hibernation,
//! alerts) are plain collaborators; the registry map is the only broadly
//! shared mutable structure, and all mutation goes through registry
//! methods.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::alerts::{AlertDispatcher, AlertEvent, AlertKind, AlertSeverity};
use crate::breaker::{BreakerReport, CircuitBreaker, Transition};
use crate::graph::DependencyGraph;
use crate::hibernate::store::{
    IndexEntry, IndexStatistics, RegistryIndex, SnapshotStore, INDEX_VERSION,
};
use crate::hibernate::HibernationManager;
use crate::types::{Error, OrchestratorConfig, Result};

pub mod component;

pub use component::{
    Component, ComponentDescriptor, ComponentFactory, ComponentState, ComponentStatus,
};

// =============================================================================
// Runtime cell
// =============================================================================

/// Runtime state for one registered component. Created at registration,
/// destroyed only on explicit deregistration.
pub(crate) struct ManagedComponent {
    pub(crate) descriptor: ComponentDescriptor,
    pub(crate) factory: ComponentFactory,
    /// Live instance; `None` while Sleeping or Stopped.
    pub(crate) instance: tokio::sync::RwLock<Option<Box<dyn Component>>>,
    /// Breaker state is mutated only under this lock.
    pub(crate) breaker: tokio::sync::Mutex<CircuitBreaker>,
    /// Sleep and wake are mutually exclusive per component.
    pub(crate) hibernate_lock: tokio::sync::Mutex<()>,
    status: Mutex<ComponentStatus>,
    pub(crate) in_flight: AtomicUsize,
    /// Set while a hibernation drain is in progress; new invokes are
    /// rejected with a transient error.
    pub(crate) draining: AtomicBool,
    /// Set when a wake failed and the component needs manual intervention.
    pub(crate) needs_attention: AtomicBool,
    last_activity: Mutex<Instant>,
    pub(crate) slept_at: Mutex<Option<DateTime<Utc>>>,
}

impl fmt::Debug for ManagedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedComponent")
            .field("name", &self.descriptor.name)
            .field("status", &self.status())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl ManagedComponent {
    fn new(descriptor: ComponentDescriptor, factory: ComponentFactory, breaker: CircuitBreaker) -> Self {
        Self {
            descriptor,
            factory,
            instance: tokio::sync::RwLock::new(None),
            breaker: tokio::sync::Mutex::new(breaker),
            hibernate_lock: tokio::sync::Mutex::new(()),
            status: Mutex::new(ComponentStatus::Uninitialized),
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            needs_attention: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            slept_at: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> ComponentStatus {
        *lock(&self.status)
    }

    /// Validated transition; every status change in the system goes
    /// through here.
    pub(crate) fn set_status(&self, to: ComponentStatus) -> Result<ComponentStatus> {
        let mut status = lock(&self.status);
        if !status.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "cannot move {} from {:?} to {:?}",
                self.descriptor.name, *status, to
            )));
        }
        let from = *status;
        *status = to;
        tracing::debug!(
            "component_status: component={}, {:?} -> {:?}",
            self.descriptor.name,
            from,
            to
        );
        Ok(from)
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Shared core
// =============================================================================

/// Component map shared between the registry, hibernation manager, and
/// supervisor. Constructed once at process start; never a package-level
/// global.
pub(crate) struct RegistryShared {
    components: RwLock<HashMap<String, Arc<ManagedComponent>>>,
    registration_order: RwLock<Vec<String>>,
}

impl fmt::Debug for RegistryShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryShared")
            .field("components", &self.names_in_order())
            .finish()
    }
}

impl RegistryShared {
    fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            registration_order: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Result<Arc<ManagedComponent>> {
        read(&self.components)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown component: {name}")))
    }

    pub(crate) fn names_in_order(&self) -> Vec<String> {
        read(&self.registration_order).clone()
    }

    /// All cells in registration order.
    pub(crate) fn all(&self) -> Vec<Arc<ManagedComponent>> {
        let components = read(&self.components);
        read(&self.registration_order)
            .iter()
            .filter_map(|name| components.get(name).cloned())
            .collect()
    }

    /// Graph over currently-registered components. Edges to names not yet
    /// registered are skipped; a cycle can only close once its last member
    /// registers, so checking at each registration is exhaustive.
    pub(crate) fn build_graph(&self) -> DependencyGraph {
        let components = read(&self.components);
        let order = read(&self.registration_order);
        graph_from(&components, &order)
    }

    pub(crate) fn build_index(&self) -> RegistryIndex {
        let mut entries = HashMap::new();
        let mut statistics = IndexStatistics::default();
        for cell in self.all() {
            let status = cell.status();
            statistics.total += 1;
            if status == ComponentStatus::Running {
                statistics.active += 1;
            }
            if status == ComponentStatus::Sleeping {
                statistics.sleeping += 1;
            }
            if cell.descriptor.is_critical {
                statistics.critical += 1;
            }
            entries.insert(
                cell.descriptor.name.clone(),
                IndexEntry {
                    status,
                    is_critical: cell.descriptor.is_critical,
                    dependencies: cell.descriptor.dependencies.clone(),
                    sleep_time: *lock(&cell.slept_at),
                },
            );
        }
        RegistryIndex {
            version: INDEX_VERSION,
            last_updated: Utc::now(),
            components: entries,
            statistics,
        }
    }

    /// Index persistence is bookkeeping, not correctness; failures are
    /// logged and the triggering operation proceeds.
    pub(crate) fn persist_index(&self, store: &dyn SnapshotStore) {
        if let Err(err) = store.save_index(&self.build_index()) {
            tracing::warn!("index_persist_failed: {}", err);
        }
    }
}

fn graph_from(
    components: &HashMap<String, Arc<ManagedComponent>>,
    order: &[String],
) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for name in order {
        // Names were validated at registration; duplicates impossible.
        let _ = graph.add_node(name);
    }
    for name in order {
        if let Some(cell) = components.get(name) {
            for dep in &cell.descriptor.dependencies {
                if components.contains_key(dep) {
                    let _ = graph.add_edge(name, dep);
                }
            }
        }
    }
    graph
}

fn read<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Reports
// =============================================================================

/// Point-in-time view of one component, including its exported
/// config/stats (from the live instance, or from its snapshot while
/// sleeping).
#[derive(Debug, Clone, Serialize)]
pub struct ComponentInfo {
    pub name: String,
    pub status: ComponentStatus,
    pub is_critical: bool,
    pub is_stateful: bool,
    pub dependencies: Vec<String>,
    pub config: Map<String, Value>,
    pub stats: Map<String, Value>,
    pub needs_attention: bool,
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub uninitialized: usize,
    pub running: usize,
    pub sleeping: usize,
    pub stopped: usize,
    pub failed: usize,
    pub critical: usize,
}

// =============================================================================
// Registry
// =============================================================================

/// Component lifecycle registry.
pub struct LifecycleRegistry {
    shared: Arc<RegistryShared>,
    store: Arc<dyn SnapshotStore>,
    alerts: Arc<AlertDispatcher>,
    hibernation: Arc<HibernationManager>,
    config: OrchestratorConfig,
    /// Startup order of the last successful `start_all`; `stop_all` runs
    /// its exact reverse.
    start_order: Mutex<Vec<String>>,
}

impl fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleRegistry")
            .field("components", &self.shared.names_in_order())
            .finish()
    }
}

impl LifecycleRegistry {
    pub fn new(config: OrchestratorConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let shared = Arc::new(RegistryShared::new());
        let alerts = Arc::new(AlertDispatcher::new(config.alerts.clone()));
        let hibernation = Arc::new(HibernationManager::new(
            shared.clone(),
            store.clone(),
            config.hibernation.clone(),
            alerts.clone(),
        ));
        Self {
            shared,
            store,
            alerts,
            hibernation,
            config,
            start_order: Mutex::new(Vec::new()),
        }
    }

    pub fn hibernation(&self) -> &Arc<HibernationManager> {
        &self.hibernation
    }

    pub fn alerts(&self) -> &Arc<AlertDispatcher> {
        &self.alerts
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub(crate) fn shared(&self) -> &Arc<RegistryShared> {
        &self.shared
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a component. The dependency graph is re-verified under the
    /// registration lock: a registration that would close a cycle is
    /// rejected atomically and leaves the registry unchanged.
    pub fn register<F>(&self, descriptor: ComponentDescriptor, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Component> + Send + Sync + 'static,
    {
        validate_name(&descriptor.name)?;

        let name = descriptor.name.clone();
        let breaker = CircuitBreaker::new(name.clone(), self.config.breaker.clone());
        let cell = Arc::new(ManagedComponent::new(descriptor, Box::new(factory), breaker));

        // Insert and re-verify under the same locks so a rejected
        // registration can never be observed by a concurrent caller.
        let mut components = write(&self.shared.components);
        let mut order = write(&self.shared.registration_order);
        if components.contains_key(&name) {
            return Err(Error::validation(format!(
                "component already registered: {name}"
            )));
        }
        components.insert(name.clone(), cell);
        order.push(name.clone());

        if let Err(err) = graph_from(&components, &order).verify() {
            components.remove(&name);
            order.retain(|n| n != &name);
            return Err(err);
        }

        tracing::debug!("component_registered: component={}", name);
        Ok(())
    }

    /// Remove a component entirely. Only valid for components that are not
    /// running, hold no in-flight calls, and have no registered dependents.
    pub fn deregister(&self, name: &str) -> Result<()> {
        let mut components = write(&self.shared.components);
        let cell = components
            .get(name)
            .ok_or_else(|| Error::not_found(format!("unknown component: {name}")))?;

        let status = cell.status();
        if !matches!(
            status,
            ComponentStatus::Uninitialized | ComponentStatus::Stopped | ComponentStatus::Failed
        ) {
            return Err(Error::state_transition(format!(
                "cannot deregister {name}: status is {status:?}"
            )));
        }
        if cell.in_flight.load(Ordering::SeqCst) > 0 {
            return Err(Error::state_transition(format!(
                "cannot deregister {name}: calls in flight"
            )));
        }
        for (other_name, other) in components.iter() {
            if other_name != name && other.descriptor.dependencies.iter().any(|d| d == name) {
                return Err(Error::validation(format!(
                    "cannot deregister {name}: {other_name} depends on it"
                )));
            }
        }

        components.remove(name);
        write(&self.shared.registration_order).retain(|n| n != name);
        tracing::info!("component_deregistered: component={}", name);
        Ok(())
    }

    // =========================================================================
    // Startup / shutdown
    // =========================================================================

    /// Start every registered component in dependency order.
    ///
    /// A cycle or an unknown dependency aborts before any init runs. A
    /// critical init failure aborts immediately, leaving later components
    /// Uninitialized; non-critical failures are recorded and skipped.
    pub async fn start_all(&self) -> Result<()> {
        let order = self.verified_order()?;
        *lock(&self.start_order) = order.clone();

        for name in &order {
            let cell = self.shared.get(name)?;
            if cell.status() != ComponentStatus::Uninitialized {
                continue;
            }
            match self.start_component(&cell).await {
                Ok(()) => {
                    self.alerts.notify(AlertEvent::new(
                        AlertKind::ComponentStarted,
                        name,
                        AlertSeverity::Info,
                        format!("component {name} started"),
                    ));
                }
                Err(err) => {
                    self.alerts.notify(AlertEvent::new(
                        AlertKind::ComponentFailed,
                        name,
                        if cell.descriptor.is_critical {
                            AlertSeverity::Critical
                        } else {
                            AlertSeverity::Warning
                        },
                        err.to_string(),
                    ));
                    if cell.descriptor.is_critical {
                        tracing::error!("critical_start_failed: component={}, error={}", name, err);
                        self.shared.persist_index(self.store.as_ref());
                        return Err(err);
                    }
                    tracing::warn!("component_start_failed: component={}, error={}", name, err);
                }
            }
        }

        self.shared.persist_index(self.store.as_ref());
        Ok(())
    }

    /// Stop every component in the exact reverse of startup order. Each
    /// stop gets a grace period to quiesce in-flight calls, after which it
    /// is force-terminated and marked Stopped regardless.
    pub async fn stop_all(&self) -> HashMap<String, Error> {
        let mut errors = HashMap::new();
        let mut order = lock(&self.start_order).clone();
        if order.is_empty() {
            order = self
                .shared
                .build_graph()
                .order()
                .unwrap_or_else(|_| self.shared.names_in_order());
        }

        for name in order.iter().rev() {
            let Ok(cell) = self.shared.get(name) else {
                continue;
            };
            match cell.status() {
                ComponentStatus::Running => {
                    if let Err(err) = self.stop_component(&cell).await {
                        errors.insert(name.clone(), err);
                    }
                }
                ComponentStatus::Sleeping => {
                    // Snapshot stays on disk for a later manual restore.
                    let _ = cell.set_status(ComponentStatus::Stopping);
                    let _ = cell.set_status(ComponentStatus::Stopped);
                    self.alerts.notify(AlertEvent::new(
                        AlertKind::ComponentStopped,
                        name,
                        AlertSeverity::Info,
                        format!("component {name} stopped while sleeping; snapshot retained"),
                    ));
                }
                _ => {}
            }
        }

        self.shared.persist_index(self.store.as_ref());
        errors
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Invoke a component through its breaker. A sleeping component is
    /// woken implicitly; the caller waits for the wake to complete.
    /// Component errors surface unchanged.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        let cell = self.shared.get(name)?;

        if cell.draining.load(Ordering::SeqCst) {
            return Err(Error::draining(format!(
                "component {name} is draining for hibernation"
            )));
        }
        match cell.status() {
            ComponentStatus::Running => {}
            ComponentStatus::Sleeping => self.hibernation.wake(name).await?,
            other => {
                return Err(Error::state_transition(format!(
                    "cannot invoke {name}: status is {other:?}"
                )))
            }
        }

        let transition = {
            let mut breaker = cell.breaker.lock().await;
            breaker.try_acquire()?
        };
        self.notify_breaker(name, transition);

        cell.in_flight.fetch_add(1, Ordering::SeqCst);
        cell.touch();
        let started = Instant::now();
        let result = self.call_instance(&cell, name, args).await;
        let latency = started.elapsed();
        cell.in_flight.fetch_sub(1, Ordering::SeqCst);
        cell.touch();

        let transition = {
            let mut breaker = cell.breaker.lock().await;
            match &result {
                Ok(_) => breaker.record_success(latency),
                Err(_) => breaker.record_failure(latency),
            }
        };
        self.notify_breaker(name, transition);

        result
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn status(&self, name: &str) -> Result<ComponentStatus> {
        Ok(self.shared.get(name)?.status())
    }

    pub fn all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.shared
            .all()
            .into_iter()
            .map(|cell| (cell.descriptor.name.clone(), cell.status()))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for cell in self.shared.all() {
            stats.total += 1;
            if cell.descriptor.is_critical {
                stats.critical += 1;
            }
            match cell.status() {
                ComponentStatus::Uninitialized | ComponentStatus::Starting => {
                    stats.uninitialized += 1
                }
                ComponentStatus::Running => stats.running += 1,
                ComponentStatus::Sleeping => stats.sleeping += 1,
                ComponentStatus::Stopping | ComponentStatus::Stopped => stats.stopped += 1,
                ComponentStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Full component view. Config/stats come from the live instance, or
    /// from the persisted snapshot while sleeping.
    pub async fn info(&self, name: &str) -> Result<ComponentInfo> {
        let cell = self.shared.get(name)?;
        let status = cell.status();

        let (config, stats) = if status == ComponentStatus::Sleeping {
            match self.hibernation.peek(name)? {
                Some(snapshot) => (snapshot.config, snapshot.stats),
                None => (Map::new(), Map::new()),
            }
        } else {
            let guard = cell.instance.read().await;
            match guard.as_ref() {
                Some(instance) => {
                    let state = instance.export_state();
                    (state.config, state.stats)
                }
                None => (Map::new(), Map::new()),
            }
        };

        Ok(ComponentInfo {
            name: cell.descriptor.name.clone(),
            status,
            is_critical: cell.descriptor.is_critical,
            is_stateful: cell.descriptor.is_stateful,
            dependencies: cell.descriptor.dependencies.clone(),
            config,
            stats,
            needs_attention: cell.needs_attention.load(Ordering::SeqCst),
        })
    }

    pub async fn breaker_report(&self, name: &str) -> Result<BreakerReport> {
        let cell = self.shared.get(name)?;
        let breaker = cell.breaker.lock().await;
        Ok(breaker.report())
    }

    // =========================================================================
    // Hibernation passthrough (control API)
    // =========================================================================

    pub async fn sleep(&self, name: &str, reason: &str) -> Result<()> {
        self.hibernation.sleep(name, reason).await
    }

    pub async fn wake(&self, name: &str) -> Result<()> {
        self.hibernation.wake(name).await
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Verify every declared dependency exists and the graph is acyclic,
    /// then return the startup order. Nothing is started on failure.
    fn verified_order(&self) -> Result<Vec<String>> {
        for cell in self.shared.all() {
            for dep in &cell.descriptor.dependencies {
                if self.shared.get(dep).is_err() {
                    return Err(Error::validation(format!(
                        "component {} depends on unregistered {dep}",
                        cell.descriptor.name
                    )));
                }
            }
        }
        self.shared.build_graph().order()
    }

    async fn start_component(&self, cell: &Arc<ManagedComponent>) -> Result<()> {
        let name = cell.descriptor.name.clone();
        cell.set_status(ComponentStatus::Starting)?;

        let mut instance = (cell.factory)();
        let init = guard_panics(
            instance.init(&cell.descriptor.init_config),
            &name,
            "init",
        )
        .await;

        match init {
            Ok(()) => {
                *cell.instance.write().await = Some(instance);
                cell.set_status(ComponentStatus::Running)?;
                cell.touch();
                tracing::info!("component_started: component={}", name);
                Ok(())
            }
            Err(err) => {
                cell.set_status(ComponentStatus::Failed)?;
                Err(Error::component_init(
                    name,
                    err.to_string(),
                    cell.descriptor.is_critical,
                ))
            }
        }
    }

    async fn stop_component(&self, cell: &Arc<ManagedComponent>) -> Result<()> {
        let name = cell.descriptor.name.clone();
        cell.set_status(ComponentStatus::Stopping)?;

        let grace = self.config.lifecycle.stop_grace;
        let deadline = Instant::now() + grace;
        let mut forced = false;
        while cell.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                forced = true;
                break;
            }
            tokio::time::sleep(self.config.lifecycle.drain_poll_interval).await;
        }

        let shutdown_result = if forced {
            // A straggler call may still hold the instance lock; do not
            // wait on it. The instance is dropped when its guard releases.
            if let Ok(mut guard) = cell.instance.try_write() {
                guard.take();
            }
            tracing::warn!(
                "component_force_stopped: component={}, in_flight={}",
                name,
                cell.in_flight.load(Ordering::SeqCst)
            );
            Err(Error::timeout(format!(
                "grace period elapsed with calls in flight: {name}"
            )))
        } else {
            match cell.instance.write().await.take() {
                Some(mut instance) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(
                        remaining.max(Duration::from_millis(1)),
                        guard_panics(instance.shutdown(), &name, "shutdown"),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::timeout(format!("shutdown timed out: {name}"))),
                    }
                }
                None => Ok(()),
            }
        };

        // Stopped regardless of how shutdown went.
        cell.set_status(ComponentStatus::Stopped)?;
        self.alerts.notify(AlertEvent::new(
            AlertKind::ComponentStopped,
            &name,
            AlertSeverity::Info,
            format!("component {name} stopped"),
        ));
        tracing::info!("component_stopped: component={}", name);
        shutdown_result
    }

    async fn call_instance(
        &self,
        cell: &Arc<ManagedComponent>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        for _attempt in 0..2 {
            {
                let guard = cell.instance.read().await;
                if let Some(instance) = guard.as_ref() {
                    return guard_panics(instance.call(args.clone()), name, "call").await;
                }
            }
            // Lost a race with hibernation between the status check and
            // the instance read; wake and retry once.
            if cell.status() == ComponentStatus::Sleeping {
                self.hibernation.wake(name).await?;
            } else {
                break;
            }
        }
        Err(Error::internal(format!("component instance missing: {name}")))
    }

    fn notify_breaker(&self, name: &str, transition: Option<Transition>) {
        if let Some(transition) = transition {
            self.alerts
                .notify(AlertEvent::breaker_transition(name, transition.from, transition.to));
        }
    }
}

/// Component names become file names and log keys; keep them tame.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("component name cannot be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::validation(format!(
            "component name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// Run a component-supplied future with panic recovery. A single component
/// panic must not bring down the orchestrator: it is captured, logged, and
/// converted to an error the breaker can record.
async fn guard_panics<F, T>(fut: F, component: &str, op: &str) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = panic_message(payload.as_ref());
            tracing::error!(
                "component_panic_recovered: component={}, op={}, panic={}",
                component,
                op,
                panic_msg
            );
            Err(Error::internal(format!(
                "panic in {component}::{op}: {panic_msg}"
            )))
        }
    }
}

/// Extract panic message from panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::hibernate::store::MemorySnapshotStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Test component: records lifecycle events into a shared log and
    /// echoes invocation args back.
    struct Probe {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_init: bool,
        fail_calls: bool,
        panic_calls: bool,
        config: Map<String, Value>,
        stats: Map<String, Value>,
    }

    #[async_trait]
    impl Component for Probe {
        async fn init(&mut self, config: &Value) -> Result<()> {
            lock(&self.log).push(format!("init:{}", self.name));
            if self.fail_init {
                return Err(Error::internal("boom"));
            }
            if let Value::Object(map) = config {
                self.config = map.clone();
            }
            Ok(())
        }

        async fn call(&self, args: Value) -> Result<Value> {
            if self.panic_calls {
                panic!("probe exploded");
            }
            if self.fail_calls {
                return Err(Error::internal("call failed"));
            }
            Ok(json!({ "echo": args }))
        }

        fn export_state(&self) -> ComponentState {
            ComponentState {
                config: self.config.clone(),
                stats: self.stats.clone(),
                serialized: None,
            }
        }

        fn import_state(&mut self, state: ComponentState) -> Result<()> {
            self.config = state.config;
            self.stats = state.stats;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            lock(&self.log).push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    struct Harness {
        registry: LifecycleRegistry,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(OrchestratorConfig::default())
        }

        fn with_config(config: OrchestratorConfig) -> Self {
            Self {
                registry: LifecycleRegistry::new(config, Arc::new(MemorySnapshotStore::new())),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn add(&self, name: &str, deps: &[&str]) {
            self.add_probe(name, deps, false, false, false, false);
        }

        fn add_probe(
            &self,
            name: &str,
            deps: &[&str],
            critical: bool,
            fail_init: bool,
            fail_calls: bool,
            panic_calls: bool,
        ) {
            let log = self.log.clone();
            let owned = name.to_string();
            let mut descriptor =
                ComponentDescriptor::new(name, deps.iter().map(|d| d.to_string()).collect());
            if critical {
                descriptor = descriptor.critical();
            }
            self.registry
                .register(descriptor, move || {
                    Box::new(Probe {
                        name: owned.clone(),
                        log: log.clone(),
                        fail_init,
                        fail_calls,
                        panic_calls,
                        config: Map::new(),
                        stats: Map::new(),
                    })
                })
                .unwrap();
        }

        fn events(&self) -> Vec<String> {
            lock(&self.log).clone()
        }
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let h = Harness::new();
        h.add("db", &[]);
        let result = h.registry.register(ComponentDescriptor::new("db", vec![]), || {
            Box::new(Probe {
                name: "db".into(),
                log: Arc::new(Mutex::new(Vec::new())),
                fail_init: false,
                fail_calls: false,
                panic_calls: false,
                config: Map::new(),
                stats: Map::new(),
            })
        });
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_register_invalid_name_rejected() {
        let h = Harness::new();
        let result = h
            .registry
            .register(ComponentDescriptor::new("../etc/passwd", vec![]), || {
                unreachable!("factory must not run")
            });
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_cycle_rejected_atomically_at_registration() {
        let h = Harness::new();
        h.add("b", &["a"]); // forward declaration, allowed
        let log = h.log.clone();
        let result = h
            .registry
            .register(ComponentDescriptor::new("a", vec!["b".into()]), move || {
                Box::new(Probe {
                    name: "a".into(),
                    log: log.clone(),
                    fail_init: false,
                    fail_calls: false,
                    panic_calls: false,
                    config: Map::new(),
                    stats: Map::new(),
                })
            });
        assert!(matches!(result, Err(Error::DependencyCycle { .. })));
        // Registration rolled back: "a" is gone, "b" untouched.
        assert!(h.registry.status("a").is_err());
        assert!(h.registry.status("b").is_ok());
    }

    #[tokio::test]
    async fn test_start_all_follows_dependency_order() {
        let h = Harness::new();
        // Registered out of order on purpose.
        h.add("c", &["b"]);
        h.add("a", &[]);
        h.add("b", &["a"]);

        h.registry.start_all().await.unwrap();
        assert_eq!(h.events(), vec!["init:a", "init:b", "init:c"]);
        assert_eq!(
            h.registry.status("c").unwrap(),
            ComponentStatus::Running
        );
    }

    #[tokio::test]
    async fn test_stop_all_is_exact_reverse() {
        let h = Harness::new();
        h.add("a", &[]);
        h.add("b", &["a"]);
        h.add("c", &["b"]);

        h.registry.start_all().await.unwrap();
        let errors = h.registry.stop_all().await;
        assert!(errors.is_empty());
        assert_eq!(
            h.events(),
            vec!["init:a", "init:b", "init:c", "shutdown:c", "shutdown:b", "shutdown:a"]
        );
        assert_eq!(h.registry.status("a").unwrap(), ComponentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_all_unknown_dependency() {
        let h = Harness::new();
        h.add("b", &["ghost"]);
        let err = h.registry.start_all().await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        // Nothing was initialized.
        assert!(h.events().is_empty());
        assert_eq!(
            h.registry.status("b").unwrap(),
            ComponentStatus::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_critical_init_failure_aborts() {
        let h = Harness::new();
        h.add("a", &[]);
        h.add_probe("crit", &["a"], true, true, false, false);
        h.add("late", &["crit"]);

        let err = h.registry.start_all().await.unwrap_err();
        assert!(matches!(err, Error::ComponentInit { critical: true, .. }));
        assert_eq!(h.registry.status("a").unwrap(), ComponentStatus::Running);
        assert_eq!(h.registry.status("crit").unwrap(), ComponentStatus::Failed);
        // No partial critical startup: later components stay untouched.
        assert_eq!(
            h.registry.status("late").unwrap(),
            ComponentStatus::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_noncritical_init_failure_continues() {
        let h = Harness::new();
        h.add("a", &[]);
        h.add_probe("flaky", &[], false, true, false, false);
        h.add("b", &[]);

        h.registry.start_all().await.unwrap();
        assert_eq!(h.registry.status("flaky").unwrap(), ComponentStatus::Failed);
        assert_eq!(h.registry.status("a").unwrap(), ComponentStatus::Running);
        assert_eq!(h.registry.status("b").unwrap(), ComponentStatus::Running);
    }

    #[tokio::test]
    async fn test_invoke_echoes_through_breaker() {
        let h = Harness::new();
        h.add("svc", &[]);
        h.registry.start_all().await.unwrap();

        let result = h.registry.invoke("svc", json!({"n": 1})).await.unwrap();
        assert_eq!(result["echo"]["n"], 1);

        let report = h.registry.breaker_report("svc").await.unwrap();
        assert_eq!(report.success_count, 1);
    }

    #[tokio::test]
    async fn test_invoke_uninitialized_rejected() {
        let h = Harness::new();
        h.add("svc", &[]);
        let err = h.registry.invoke("svc", json!(null)).await.unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
    }

    #[tokio::test]
    async fn test_invoke_unknown_component() {
        let h = Harness::new();
        let err = h.registry.invoke("ghost", json!(null)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let config = OrchestratorConfig {
            breaker: BreakerConfig {
                min_calls_for_analysis: 3,
                error_rate_threshold: 0.5,
                failure_threshold: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        let h = Harness::with_config(config);
        h.add_probe("flaky", &[], false, false, true, false);
        h.registry.start_all().await.unwrap();

        for _ in 0..3 {
            let err = h.registry.invoke("flaky", json!(null)).await.unwrap_err();
            assert!(matches!(err, Error::Internal(_)));
        }
        // Breaker is open now; the component itself is no longer reached.
        let err = h.registry.invoke("flaky", json!(null)).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert!(err.retry_after().is_some());

        let report = h.registry.breaker_report("flaky").await.unwrap();
        assert_eq!(report.failure_count, 3);
        assert_eq!(report.times_opened, 1);
    }

    #[tokio::test]
    async fn test_component_panic_is_recovered() {
        let h = Harness::new();
        h.add_probe("bomb", &[], false, false, false, true);
        h.registry.start_all().await.unwrap();

        let err = h.registry.invoke("bomb", json!(null)).await.unwrap_err();
        match err {
            Error::Internal(msg) => assert!(msg.contains("probe exploded")),
            other => panic!("expected Internal, got {other:?}"),
        }
        // The orchestrator survived and recorded the failure.
        let report = h.registry.breaker_report("bomb").await.unwrap();
        assert_eq!(report.failure_count, 1);
    }

    #[tokio::test]
    async fn test_stats_and_statuses() {
        let h = Harness::new();
        h.add("a", &[]);
        h.add_probe("crit", &[], true, false, false, false);
        h.registry.start_all().await.unwrap();

        let stats = h.registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.critical, 1);

        let statuses = h.registry.all_statuses();
        assert_eq!(statuses["a"], ComponentStatus::Running);
        assert_eq!(statuses["crit"], ComponentStatus::Running);
    }

    #[tokio::test]
    async fn test_deregister_rules() {
        let h = Harness::new();
        h.add("a", &[]);
        h.add("b", &["a"]);

        // "a" has a dependent.
        assert!(matches!(
            h.registry.deregister("a"),
            Err(Error::Validation(_))
        ));
        // "b" is Uninitialized, fine.
        h.registry.deregister("b").unwrap();
        // Now "a" can go too.
        h.registry.deregister("a").unwrap();
        assert!(h.registry.status("a").is_err());

        h.add("c", &[]);
        h.registry.start_all().await.unwrap();
        // Running components cannot be deregistered.
        assert!(matches!(
            h.registry.deregister("c"),
            Err(Error::StateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_start_all_twice_is_idempotent() {
        let h = Harness::new();
        h.add("a", &[]);
        h.registry.start_all().await.unwrap();
        h.registry.start_all().await.unwrap();
        assert_eq!(h.events(), vec!["init:a"]);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("av-scanner_v2.1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a b").is_err());
    }
}
