//! Core types for the service host.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ServiceId, WorkerId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for supervisor, workers and logging

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig, ServicesDir, SupervisorConfig, WorkersConfig};
pub use errors::{Error, ErrorReport, Result, WORKER_INTERNAL_ERROR};
pub use ids::{ServiceId, WorkerId};
