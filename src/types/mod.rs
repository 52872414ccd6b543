//! Core types for the steward orchestrator.
//!
//! This module provides foundational types used throughout the system:
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Aggregated configuration for all subsystems

mod config;
mod errors;

pub use config::{LifecycleConfig, OrchestratorConfig};
pub use errors::{Error, Result};
