//! Worker supervision.
//!
//! - [`WorkersManager`]: actor that launches, tracks and terminates workers
//! - [`CorrelationTable`]: matches replies to the calls that caused them
//! - [`WorkerMessage`]: the envelope every worker channel carries
//! - [`TaskLauncher`] / [`ProcessLauncher`]: in-process and child-process units

pub mod codec;
mod correlation;
mod handle;
mod launcher;
mod manager;
mod message;
mod process;
mod task;

pub use correlation::{CorrelationTable, Pending, Waiter};
pub use handle::{WorkerCallbacks, WorkerHandle};
pub use launcher::{Launchers, WorkerEvent, WorkerEvents, WorkerLauncher, WorkerLink};
pub use manager::{SpawnRequest, WorkerStats, WorkersManager, ESCALATION_PROVIDER};
pub use message::{Inbound, ReplyStatus, WorkerMessage, BROADCAST_COMMAND, ERROR_COMMAND};
pub use process::{ProcessLauncher, WORKER_CHANNEL_BROKEN, WORKER_EXIT_STATUS};
pub use task::{TaskLauncher, WORKER_PANIC};
