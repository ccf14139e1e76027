//! Service supervision: discovery, lifecycle and restart policy.

mod api;
mod discovery;
mod manager;
mod policy;
mod types;

pub use api::register_commands;
pub use discovery::{read_meta, scan_dir, Discovered};
pub use manager::{update_channel, ServiceManager};
pub use policy::RestartPolicy;
pub use types::{merge_export, ServiceConfig, ServiceMeta, ServiceStatus};
