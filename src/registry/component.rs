//! Component capability surface and lifecycle state machine.
//!
//! State transitions:
//! ```text
//! UNINITIALIZED → STARTING → RUNNING ⇄ SLEEPING
//!                     ↓         ↓          ↓
//!                  FAILED    STOPPING → STOPPED
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Result;

/// Component lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Uninitialized,
    Starting,
    Running,
    Sleeping,
    Stopping,
    Stopped,
    Failed,
}

impl ComponentStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ComponentStatus::Stopped | ComponentStatus::Failed)
    }

    /// Check if a caller may route an invocation here (Sleeping implies an
    /// implicit wake first).
    pub fn is_invokable(self) -> bool {
        matches!(self, ComponentStatus::Running | ComponentStatus::Sleeping)
    }

    /// Check if transition is valid. No transition skips a state.
    pub fn can_transition_to(self, to: ComponentStatus) -> bool {
        match (self, to) {
            // UNINITIALIZED
            (ComponentStatus::Uninitialized, ComponentStatus::Starting) => true,
            // STARTING
            (ComponentStatus::Starting, ComponentStatus::Running) => true,
            (ComponentStatus::Starting, ComponentStatus::Failed) => true,
            // RUNNING
            (ComponentStatus::Running, ComponentStatus::Sleeping) => true,
            (ComponentStatus::Running, ComponentStatus::Stopping) => true,
            (ComponentStatus::Running, ComponentStatus::Failed) => true,
            // SLEEPING
            (ComponentStatus::Sleeping, ComponentStatus::Running) => true, // Woken
            (ComponentStatus::Sleeping, ComponentStatus::Stopping) => true,
            (ComponentStatus::Sleeping, ComponentStatus::Stopped) => true, // Failed restore
            // STOPPING
            (ComponentStatus::Stopping, ComponentStatus::Stopped) => true,
            // Terminal states
            (ComponentStatus::Stopped, _) => false,
            (ComponentStatus::Failed, _) => false,
            // All other transitions invalid
            _ => false,
        }
    }
}

/// Identity and policy for one managed component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Unique registry key.
    pub name: String,

    /// Names of components this one depends on (started first, stopped
    /// last).
    pub dependencies: Vec<String>,

    /// Never hibernated; startup failure aborts the whole orchestrator.
    pub is_critical: bool,

    /// Carries large opaque state that must be explicitly serialized on
    /// hibernation.
    pub is_stateful: bool,

    /// Opaque config handed to `Component::init` at startup.
    #[serde(default)]
    pub init_config: Value,

    pub registered_at: DateTime<Utc>,
}

impl ComponentDescriptor {
    pub fn new(name: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            name: name.into(),
            dependencies,
            is_critical: false,
            is_stateful: false,
            init_config: Value::Null,
            registered_at: Utc::now(),
        }
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    pub fn stateful(mut self) -> Self {
        self.is_stateful = true;
        self
    }

    pub fn with_init_config(mut self, config: Value) -> Self {
        self.init_config = config;
        self
    }
}

/// Exported component state: opaque config and stats maps, plus raw
/// serialized bytes (model weights etc.) for stateful components.
#[derive(Debug, Clone, Default)]
pub struct ComponentState {
    pub config: Map<String, Value>,
    pub stats: Map<String, Value>,
    pub serialized: Option<Vec<u8>>,
}

/// Minimal capability surface every hosted component implements.
///
/// Business logic stays opaque to the orchestrator: it only initializes,
/// calls, and moves state in and out.
#[async_trait]
pub trait Component: Send + Sync {
    /// One-time initialization at startup.
    async fn init(&mut self, config: &Value) -> Result<()>;

    /// Handle one invocation. May run concurrently with other calls into
    /// the same instance.
    async fn call(&self, args: Value) -> Result<Value>;

    /// Export config/stats (and serialized state for stateful components)
    /// ahead of hibernation.
    fn export_state(&self) -> ComponentState;

    /// Restore previously exported state into a fresh instance, skipping
    /// the re-initialization cost of `init`.
    fn import_state(&mut self, state: ComponentState) -> Result<()>;

    /// Graceful shutdown hook, called within the stop grace period.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Constructor used at startup and again on wake.
pub type ComponentFactory = Box<dyn Fn() -> Box<dyn Component> + Send + Sync>;
