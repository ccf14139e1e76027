//! Code that runs inside a worker unit.
//!
//! - [`WorkerProvider`]: the worker's end of the supervisor channel
//! - [`run_worker`]: the unit body shared by every launcher
//! - [`serve_stream`] / [`run_stdio_worker`]: the same body over a framed byte stream

mod provider;
mod recovery;
mod runtime;

pub use provider::{WorkerProvider, SUPERVISOR_PROVIDER};
pub use recovery::{panic_message, with_recovery};
pub use runtime::{run_stdio_worker, run_worker, serve_stream, ServiceLoader};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use crate::types::{Result, ServiceId};

/// What a worker unit was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Long-running service worker.
    Worker,
    /// Throwaway unit that only validates a service.
    Check,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Worker => "worker",
            WorkerKind::Check => "check",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup payload handed to a worker unit.
///
/// `__index` and `__id` are stamped by the supervisor; the worker echoes them
/// back in its "loaded" signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStartup {
    #[serde(rename = "__index", default)]
    pub index: u64,
    #[serde(rename = "__id", default)]
    pub id: u64,
    pub service: ServiceId,
    pub kind: WorkerKind,
    /// `<kind>::<service>`
    pub container_id: String,
    /// Process definition replacing the default one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_file: Option<PathBuf>,
    /// Config overlay applied to the default process definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_file: Option<PathBuf>,
}

impl WorkerStartup {
    pub fn new(service: ServiceId, kind: WorkerKind) -> Self {
        Self {
            index: 0,
            id: 0,
            container_id: format!("{kind}::{service}"),
            service,
            kind,
            process_file: None,
            conf_file: None,
        }
    }

    pub fn with_process_file(mut self, path: PathBuf) -> Self {
        self.process_file = Some(path);
        self
    }

    pub fn with_conf_file(mut self, path: PathBuf) -> Self {
        self.conf_file = Some(path);
        self
    }

    pub fn stamped(mut self, index: u64, id: u64) -> Self {
        self.index = index;
        self.id = id;
        self
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_startup_wire_shape() {
        let startup = WorkerStartup::new(ServiceId::try_from("meter").unwrap(), WorkerKind::Check)
            .with_conf_file(PathBuf::from("services/meter.conf.json"))
            .stamped(5, 2);

        assert_eq!(
            startup.to_value().unwrap(),
            json!({
                "__index": 5,
                "__id": 2,
                "service": "meter",
                "kind": "check",
                "containerId": "check::meter",
                "confFile": "services/meter.conf.json",
            })
        );
    }

    #[test]
    fn test_startup_rejects_missing_service() {
        let err = WorkerStartup::from_value(json!({"__index": 1, "__id": 1})).unwrap_err();
        assert_eq!(err.code(), "SERIALIZATION");
    }
}
