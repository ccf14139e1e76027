//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Errors that have to cross a worker
//! channel are objectified into an [`ErrorReport`] first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use super::ids::{ServiceId, WorkerId};

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the service host.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (malformed envelopes, bad identifiers).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (unknown command, unknown route).
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller level is not allowed to run the command.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Native creation of a worker unit failed.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The worker exited; every task queued against it was dropped.
    #[error("worker exited, all pending tasks were dropped")]
    WorkerExited,

    /// The worker is not (or no longer) registered.
    #[error("worker {0} is gone")]
    WorkerGone(WorkerId),

    /// The service running inside a worker failed; carries the imported cause.
    #[error("service worker failed: {0}")]
    WorkerInternal(ErrorReport),

    /// A command a worker sent to the host failed.
    #[error("internal command failed: {0}")]
    InternalCommand(ErrorReport),

    #[error("service {0} not found")]
    ServiceNotFound(ServiceId),

    #[error("metadata of service {0} not found")]
    MetaNotFound(ServiceId),

    #[error("service {0} is already running")]
    ServiceRunning(ServiceId),

    #[error("service {0} is not running")]
    ServiceNotRunning(ServiceId),

    #[error("services dir not found: {0}")]
    ServicesDirNotFound(String),

    #[error("submaster command has no target service")]
    SubmasterCommandNotFound,

    #[error("service host is shutting down")]
    ShuttingDown,

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short, stable error code used in reports and classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AccessDenied(_) => "ACCESS_DENIED",
            Error::Internal(_) => "INTERNAL",
            Error::Spawn(_) => "SPAWN_FAILED",
            Error::WorkerExited => "WORKER_EXITED",
            Error::WorkerGone(_) => "WORKER_GONE",
            Error::WorkerInternal(_) => "WORKER_INTERNAL_ERROR",
            Error::InternalCommand(_) => "INTERNAL_COMMAND_ERROR",
            Error::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Error::MetaNotFound(_) => "META_NOT_FOUND",
            Error::ServiceRunning(_) => "SERVICE_RUNNING",
            Error::ServiceNotRunning(_) => "SERVICE_NOT_RUNNING",
            Error::ServicesDirNotFound(_) => "SERVICE_DIR_NOT_FOUND",
            Error::SubmasterCommandNotFound => "SUBMASTER_COMMAND_NOT_FOUND",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// True for the rejection every pending request gets when its worker ends.
    pub fn is_worker_exit(&self) -> bool {
        matches!(self, Error::WorkerExited | Error::WorkerGone(_))
    }

    /// Objectify the error so it can travel over a worker channel.
    pub fn to_report(&self) -> ErrorReport {
        match self {
            Error::WorkerInternal(cause) | Error::InternalCommand(cause) => {
                ErrorReport::new(self.code(), self.to_string()).with_nested(cause.clone())
            }
            _ => ErrorReport::new(self.code(), self.to_string()),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }
}

/// Serializable error object exchanged between host and workers.
///
/// `nested` holds the causes added on the way up; the first nested error of a
/// crash report is its root cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<ErrorReport>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Code of the wrapper put around every crash a worker reports.
pub const WORKER_INTERNAL_ERROR: &str = "WORKER_INTERNAL_ERROR";

impl ErrorReport {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            nested: Vec::new(),
            data: Value::Null,
        }
    }

    pub fn with_nested(mut self, cause: ErrorReport) -> Self {
        self.nested.push(cause);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Wrap a crash cause the way the worker supervisor surfaces it.
    pub fn worker_internal(cause: ErrorReport) -> Self {
        Self::new(
            WORKER_INTERNAL_ERROR,
            "an error occurred within the service, causing it to terminate",
        )
        .with_nested(cause)
    }

    /// Code of the first nested error, if any.
    pub fn root_code(&self) -> Option<&str> {
        self.nested.first().map(|cause| cause.code.as_str())
    }

    /// Import a `resultData` value sent by the other side of a channel.
    ///
    /// Anything that is not an objectified error is kept as opaque data.
    pub fn import(value: Value) -> Self {
        match serde_json::from_value::<ErrorReport>(value.clone()) {
            Ok(report) => report,
            Err(_) => Self::new("UNKNOWN", "unrecognized error payload").with_data(value),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        err.to_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root_code_is_first_nested() {
        let report = ErrorReport::worker_internal(ErrorReport::new("CONF_BAD", "bad config"))
            .with_nested(ErrorReport::new("OTHER", "second"));
        assert_eq!(report.code, WORKER_INTERNAL_ERROR);
        assert_eq!(report.root_code(), Some("CONF_BAD"));
        assert_eq!(ErrorReport::new("X", "no cause").root_code(), None);
    }

    #[test]
    fn test_import_round_trips_report() {
        let original = ErrorReport::new("CTR_ERROR_INIT_DEVICE", "device failed")
            .with_data(json!({"device": "modbus"}));
        let imported = ErrorReport::import(original.to_value());
        assert_eq!(imported, original);
    }

    #[test]
    fn test_import_keeps_foreign_payload_as_data() {
        let imported = ErrorReport::import(json!("boom"));
        assert_eq!(imported.code, "UNKNOWN");
        assert_eq!(imported.data, json!("boom"));
    }

    #[test]
    fn test_worker_internal_report_keeps_cause() {
        let cause = ErrorReport::new("E_IO", "disk gone");
        let err = Error::WorkerInternal(cause.clone());
        let report = err.to_report();
        assert_eq!(report.code, "WORKER_INTERNAL_ERROR");
        assert_eq!(report.nested, vec![cause]);
    }

    #[test]
    fn test_worker_exit_classification() {
        assert!(Error::WorkerExited.is_worker_exit());
        assert!(Error::WorkerGone(WorkerId::new(3)).is_worker_exit());
        assert!(!Error::internal("x").is_worker_exit());
        assert_eq!(Error::WorkerExited.code(), "WORKER_EXITED");
    }
}
