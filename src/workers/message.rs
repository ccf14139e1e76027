//! Channel envelope exchanged between the supervisor and a worker.
//!
//! One shape carries every kind of traffic; the fields that are set decide
//! what a message is:
//!
//! | fields                                   | meaning                              |
//! |------------------------------------------|--------------------------------------|
//! | `__index`, no `result`                   | supervisor → worker request          |
//! | `__index`, `result`                      | worker → supervisor reply            |
//! | `internal`, `iIndex`, no `result`        | worker → supervisor escalation       |
//! | `internal`, `iIndex`, `result`           | supervisor → worker escalation reply |
//! | `command == "broadcast"`, `channel`      | fire-and-forget broadcast            |
//! | `command == "error"`, `error`            | fatal failure report                 |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Error, ErrorReport, Result};

/// Command name of broadcast messages.
pub const BROADCAST_COMMAND: &str = "broadcast";
/// Command name of fatal failure reports.
pub const ERROR_COMMAND: &str = "error";

/// Outcome tag of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(default)]
    pub command: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Parent-side correlation index.
    #[serde(rename = "__index", default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,

    /// Worker id echoed back by the "loaded" signal.
    #[serde(rename = "__id", default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,

    /// Set on escalations and their replies.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,

    /// Worker-side correlation index.
    #[serde(rename = "iIndex", default, skip_serializing_if = "Option::is_none")]
    pub internal_index: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ReplyStatus>,

    #[serde(
        rename = "resultData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub result_data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// What an inbound message is, decided in a fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Escalation,
    Broadcast,
    Fatal,
    Reply(u64),
    Unmatched,
}

impl WorkerMessage {
    /// A command for the other side.
    pub fn request(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
            ..Self::default()
        }
    }

    pub fn broadcast(channel: impl Into<String>, data: Value) -> Self {
        Self {
            command: BROADCAST_COMMAND.to_string(),
            channel: Some(channel.into()),
            data,
            ..Self::default()
        }
    }

    pub fn fatal(report: ErrorReport) -> Self {
        Self {
            command: ERROR_COMMAND.to_string(),
            error: Some(report),
            ..Self::default()
        }
    }

    /// A worker-initiated request toward the supervisor.
    pub fn escalation(command: impl Into<String>, data: Value, internal_index: u64) -> Self {
        Self {
            command: command.into(),
            data,
            internal: true,
            internal_index: Some(internal_index),
            ..Self::default()
        }
    }

    /// Turn a request into its reply, keeping every correlation field.
    pub fn into_reply(mut self, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => {
                self.result = Some(ReplyStatus::Success);
                self.result_data = Some(value);
            }
            Err(err) => {
                self.result = Some(ReplyStatus::Error);
                self.result_data = Some(err.to_report().to_value());
            }
        }
        self
    }

    /// Classify a message received by the supervisor.
    ///
    /// Order: escalation, broadcast, fatal report, correlated reply.
    pub fn classify(&self) -> Inbound {
        if self.internal {
            return Inbound::Escalation;
        }
        if self.command == BROADCAST_COMMAND {
            return Inbound::Broadcast;
        }
        if self.command == ERROR_COMMAND {
            return Inbound::Fatal;
        }
        match self.index {
            Some(index) if index != 0 => Inbound::Reply(index),
            _ => Inbound::Unmatched,
        }
    }

    /// Outcome carried by a reply; untagged replies count as success.
    pub fn reply_outcome(&self) -> Result<Value> {
        let data = self.result_data.clone().unwrap_or(Value::Null);
        match self.result {
            Some(ReplyStatus::Error) => Err(Error::WorkerInternal(ErrorReport::import(data))),
            _ => Ok(data),
        }
    }

    /// Outcome of an escalation reply, `None` when the message carries no result.
    pub fn escalation_outcome(&self) -> Option<Result<Value>> {
        let data = self.result_data.clone().unwrap_or(Value::Null);
        match self.result? {
            ReplyStatus::Success => Some(Ok(data)),
            ReplyStatus::Error => Some(Err(Error::InternalCommand(ErrorReport::import(data)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let mut msg = WorkerMessage::escalation("getDevice", json!({"id": 1}), 4);
        msg.index = Some(9);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "command": "getDevice",
                "data": {"id": 1},
                "__index": 9,
                "internal": true,
                "iIndex": 4,
            })
        );
    }

    #[test]
    fn test_loaded_signal_parses_as_reply() {
        let msg: WorkerMessage =
            serde_json::from_value(json!({"__index": 3, "__id": 2, "resultData": 2})).unwrap();
        assert_eq!(msg.classify(), Inbound::Reply(3));
        assert_eq!(msg.reply_outcome().unwrap(), json!(2));
    }

    #[test]
    fn test_classification_order() {
        // A broadcast that happens to carry an index is still a broadcast.
        let mut broadcast = WorkerMessage::broadcast("ch", json!(1));
        broadcast.index = Some(1);
        assert_eq!(broadcast.classify(), Inbound::Broadcast);

        // Escalation wins over everything.
        let mut escalation = WorkerMessage::escalation("error", Value::Null, 1);
        escalation.index = Some(5);
        assert_eq!(escalation.classify(), Inbound::Escalation);

        let fatal = WorkerMessage::fatal(ErrorReport::new("E", "boom"));
        assert_eq!(fatal.classify(), Inbound::Fatal);

        assert_eq!(WorkerMessage::request("ping", Value::Null).classify(), Inbound::Unmatched);
    }

    #[test]
    fn test_error_reply_imports_cause() {
        let request = WorkerMessage::request("start", Value::Null);
        let reply = request.into_reply(Err(Error::internal("device init failed")));
        assert_eq!(reply.result, Some(ReplyStatus::Error));

        match reply.reply_outcome() {
            Err(Error::WorkerInternal(cause)) => {
                assert_eq!(cause.code, "INTERNAL");
                assert!(cause.message.contains("device init failed"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_escalation_outcome() {
        let request = WorkerMessage::escalation("lookup", Value::Null, 1);
        assert!(request.escalation_outcome().is_none());

        let ok = request.clone().into_reply(Ok(json!("found")));
        assert_eq!(ok.escalation_outcome().unwrap().unwrap(), json!("found"));

        let failed = request.into_reply(Err(Error::not_found("nope")));
        assert!(matches!(
            failed.escalation_outcome(),
            Some(Err(Error::InternalCommand(report))) if report.code == "NOT_FOUND"
        ));
    }
}
