//! # Steward Core - Component Lifecycle Orchestrator
//!
//! Registry-driven lifecycle management for a large population of
//! loosely-coupled, independently-addressable in-process components:
//! - Dependency-ordered startup and exact-reverse shutdown
//! - Adaptive circuit breaking on every component invocation
//! - Hibernation of idle, non-critical components with durable snapshots
//!   (including large opaque state artifacts) and implicit wake-on-invoke
//! - Rate-limited alerting on breaker and lifecycle transitions
//!
//! ## Architecture
//!
//! The registry owns all component cells; collaborators are plain structs
//! sharing the same map:
//! ```text
//!                     ┌───────────────────────────────────┐
//!   invoke/start/stop │       LifecycleRegistry           │
//!        ───────────► │  ┌──────────┐  ┌──────────────┐   │
//!                     │  │Dependency│  │CircuitBreaker│   │
//!                     │  │  Graph   │  │ (per comp.)  │   │
//!                     │  └──────────┘  └──────────────┘   │
//!                     │  ┌──────────┐  ┌──────────────┐   │
//!     Supervisor ───► │  │Hibernate │  │    Alert     │   │
//!     (periodic tick) │  │ Manager  │  │  Dispatcher  │   │
//!                     │  └────┬─────┘  └──────────────┘   │
//!                     └───────┼───────────────────────────┘
//!                             ▼
//!                       SnapshotStore (atomic writes)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod alerts;
pub mod breaker;
pub mod graph;
pub mod hibernate;
pub mod registry;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use hibernate::{FileSnapshotStore, HibernationManager, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use registry::{
    Component, ComponentDescriptor, ComponentState, ComponentStatus, LifecycleRegistry,
};
pub use supervisor::Supervisor;
pub use types::{Error, OrchestratorConfig, Result};
