//! # Service Host - control plane of a multi-service host
//!
//! Runs every service in its own worker unit and supervises it:
//! - Worker supervision with correlated request/response over one channel per worker
//! - In-worker bridge for escalations, broadcasts and fatal reports
//! - Service lifecycle with delayed restarts and crash classification
//! - Bounded per-service error history
//! - Command bus and broadcast fan-out shared by the host and its workers
//!
//! ## Architecture
//!
//! The worker supervisor is a single actor that owns every worker handle and
//! the parent-side correlation table:
//! ```text
//!                    ┌─────────────────────────────────┐
//!  ServiceManager →  │       WorkersManager actor      │
//!                    │  ┌──────────┐ ┌─────────────┐   │
//!                    │  │ Workers  │ │ Correlation │   │
//!                    │  │ handles  │ │    table    │   │
//!                    │  └──────────┘ └─────────────┘   │
//!                    └───────┬─────────────────▲───────┘
//!                            │ WorkerMessage   │ WorkerEvent
//!                    ┌───────▼─────────────────┴───────┐
//!                    │  worker unit (task or process)  │
//!                    │        WorkerProvider           │
//!                    └─────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod commbus;
pub mod host;
pub mod services;
pub mod types;
pub mod worker;
pub mod workers;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
