//! Background supervision.
//!
//! One dedicated task owns all periodic work - the hibernation idle scan,
//! the breaker adaptive-tuning sweep, and the alert-cooldown expiry sweep -
//! on a fixed tick. No busy polling; cancellation is explicit via a
//! [`CancellationToken`] rather than a shared "running" flag.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertDispatcher;
use crate::hibernate::HibernationManager;
use crate::registry::{LifecycleRegistry, RegistryShared};

/// Supervisory loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Fixed tick interval for all periodic work.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Owns the periodic tick over a registry's subsystems.
#[derive(Debug)]
pub struct Supervisor {
    shared: Arc<RegistryShared>,
    hibernation: Arc<HibernationManager>,
    alerts: Arc<AlertDispatcher>,
    config: SupervisorConfig,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(registry: &LifecycleRegistry, config: SupervisorConfig) -> Self {
        Self {
            shared: registry.shared().clone(),
            hibernation: registry.hibernation().clone(),
            alerts: registry.alerts().clone(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the supervisory loop. Returns immediately; work runs in a
    /// spawned task until [`stop`](Self::stop) is called.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        let hibernation = self.hibernation.clone();
        let alerts = self.alerts.clone();
        let cancel = self.cancel.clone();
        let tick = self.config.tick_interval;

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_tick(&shared, &hibernation, &alerts).await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("supervisor_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Cancel the loop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One full tick. Also callable directly for deterministic tests.
    pub async fn run_once(&self) {
        Self::run_tick(&self.shared, &self.hibernation, &self.alerts).await;
    }

    async fn run_tick(
        shared: &Arc<RegistryShared>,
        hibernation: &Arc<HibernationManager>,
        alerts: &Arc<AlertDispatcher>,
    ) {
        let scan = hibernation.scan().await;

        // Retune breakers that are due but idle (the call path retunes the
        // busy ones inline).
        let mut retuned = 0usize;
        for cell in shared.all() {
            if cell.breaker.lock().await.retune_if_due() {
                retuned += 1;
            }
        }

        let alert_records_swept = alerts.sweep();

        tracing::debug!(
            "supervisor_tick: examined={}, slept={}, retuned={}, alert_records_swept={}",
            scan.examined,
            scan.slept,
            retuned,
            alert_records_swept,
        );
    }
}
