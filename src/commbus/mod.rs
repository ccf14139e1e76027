//! Command routing and broadcast fan-out.
//!
//! The host and every worker own a [`CommandBus`]: a registry of named
//! command handlers with a single `dispatch` entry point. The host bus is the
//! command router services escalate to; a worker's bus is where commands from
//! the supervisor land.
//!
//! Patterns supported:
//!   - **Commands**: request/response to a single named handler
//!   - **Broadcasts**: fire-and-forget fan-out to channel subscribers (see [`broadcast`])

pub mod broadcast;

pub use broadcast::{Broadcast, BroadcastSink, BroadcastStats, Broadcaster, Subscription};

use crate::types::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// Message Types
// =============================================================================

/// A fully-formed command as handed to a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Kind of provider the command came through (`internal`, `ServiceManager`, ...).
    pub provider_type: String,
    #[serde(default)]
    pub provider_id: u64,
    #[serde(default)]
    pub client_id: u64,
    /// Access level of the caller; 0 is the most privileged.
    #[serde(default)]
    pub level: u8,
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

impl CommandEnvelope {
    /// Envelope for a command issued by host code itself (level 0).
    pub fn internal(
        provider_type: impl Into<String>,
        command: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            provider_type: provider_type.into(),
            provider_id: 0,
            client_id: 0,
            level: 0,
            command: command.into(),
            data,
        }
    }
}

// =============================================================================
// Router / Handler Traits
// =============================================================================

/// Anything that executes command envelopes.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn dispatch(&self, envelope: CommandEnvelope) -> Result<Value>;
}

/// Handler for one named command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, envelope: CommandEnvelope) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, envelope: CommandEnvelope) -> Result<Value> {
        (self)(envelope).await
    }
}

/// Registration data for a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    pub description: String,
    /// Highest caller level allowed to run the command.
    pub level: u8,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, description: impl Into<String>, level: u8) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
            level,
        }
    }
}

struct Registered {
    spec: CommandSpec,
    handler: Arc<dyn CommandHandler>,
}

// =============================================================================
// CommandBus - In-Memory Router
// =============================================================================

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub commands_dispatched: u64,
    pub commands_failed: u64,
    pub registered_commands: usize,
}

/// In-memory command router.
pub struct CommandBus {
    /// Command handlers: command name -> registration
    handlers: RwLock<HashMap<String, Registered>>,

    /// Receives every command without a registered handler.
    fallback: RwLock<Option<Arc<dyn CommandHandler>>>,

    /// Statistics
    stats: RwLock<BusStats>,
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBus").finish_non_exhaustive()
    }
}

impl CommandBus {
    /// Create a new CommandBus instance.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
            stats: RwLock::new(BusStats::default()),
        }
    }

    /// Register a command handler.
    pub async fn register(
        &self,
        spec: CommandSpec,
        handler: impl CommandHandler + 'static,
    ) -> Result<()> {
        let mut handlers = self.handlers.write().await;

        if handlers.contains_key(&spec.command) {
            return Err(Error::validation(format!(
                "Command handler already registered: {}",
                spec.command
            )));
        }

        tracing::debug!(command = %spec.command, level = spec.level, "command registered");
        handlers.insert(
            spec.command.clone(),
            Registered {
                spec,
                handler: Arc::new(handler),
            },
        );

        let mut stats = self.stats.write().await;
        stats.registered_commands = handlers.len();

        Ok(())
    }

    /// Unregister a command handler.
    pub async fn unregister(&self, command: &str) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.remove(command);

        let mut stats = self.stats.write().await;
        stats.registered_commands = handlers.len();

        tracing::debug!(command, "command unregistered");

        Ok(())
    }

    /// Route commands that have no registered handler to `handler`.
    ///
    /// The fallback runs without a level check; its target decides.
    pub async fn set_fallback(&self, handler: impl CommandHandler + 'static) {
        *self.fallback.write().await = Some(Arc::new(handler));
        tracing::debug!("fallback handler set");
    }

    /// List registered commands, sorted by name.
    pub async fn commands(&self) -> Vec<CommandSpec> {
        let handlers = self.handlers.read().await;
        let mut specs: Vec<CommandSpec> = handlers.values().map(|r| r.spec.clone()).collect();
        specs.sort_by(|a, b| a.command.cmp(&b.command));
        specs
    }

    /// Get current bus statistics.
    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }

    async fn resolve(&self, envelope: &CommandEnvelope) -> Result<Arc<dyn CommandHandler>> {
        let handlers = self.handlers.read().await;
        let Some(registered) = handlers.get(&envelope.command) else {
            return self.fallback.read().await.clone().ok_or_else(|| {
                Error::not_found(format!(
                    "No handler registered for command: {}",
                    envelope.command
                ))
            });
        };

        if envelope.level > registered.spec.level {
            return Err(Error::access_denied(format!(
                "level {} cannot run {} (requires {} or lower)",
                envelope.level, envelope.command, registered.spec.level
            )));
        }

        Ok(registered.handler.clone())
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRouter for CommandBus {
    async fn dispatch(&self, envelope: CommandEnvelope) -> Result<Value> {
        let command = envelope.command.clone();
        let outcome = match self.resolve(&envelope).await {
            Ok(handler) => handler.handle(envelope).await,
            Err(err) => Err(err),
        };

        let mut stats = self.stats.write().await;
        stats.commands_dispatched += 1;
        if outcome.is_err() {
            stats.commands_failed += 1;
        }
        drop(stats);

        tracing::debug!(command = %command, ok = outcome.is_ok(), "command dispatched");
        outcome
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_spec(level: u8) -> CommandSpec {
        CommandSpec::new("echo", "Echo data back", level)
    }

    async fn echo(envelope: CommandEnvelope) -> Result<Value> {
        Ok(envelope.data)
    }

    async fn noop(_envelope: CommandEnvelope) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn fail(_envelope: CommandEnvelope) -> Result<Value> {
        Err(Error::internal("handler broke"))
    }

    #[tokio::test]
    async fn test_dispatch_no_handler() {
        let bus = CommandBus::new();

        let result = bus
            .dispatch(CommandEnvelope::internal("test", "missing", Value::Null))
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(err.to_string().contains("No handler registered"));

        let stats = bus.get_stats().await;
        assert_eq!(stats.commands_dispatched, 1);
        assert_eq!(stats.commands_failed, 1);
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let bus = CommandBus::new();
        bus.register(echo_spec(3), echo).await.unwrap();

        let result = bus
            .dispatch(CommandEnvelope::internal("test", "echo", json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(result, json!({"a": 1}));

        let stats = bus.get_stats().await;
        assert_eq!(stats.commands_dispatched, 1);
        assert_eq!(stats.commands_failed, 0);
        assert_eq!(stats.registered_commands, 1);
    }

    #[tokio::test]
    async fn test_register_duplicate_handler() {
        let bus = CommandBus::new();
        bus.register(echo_spec(1), noop).await.unwrap();

        let result = bus.register(echo_spec(1), noop).await;
        assert!(result.unwrap_err().to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_level_above_command_is_denied() {
        let bus = CommandBus::new();
        bus.register(echo_spec(1), echo).await.unwrap();

        let mut envelope = CommandEnvelope::internal("ws", "echo", json!(1));
        envelope.level = 3;
        let err = bus.dispatch(envelope.clone()).await.unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");

        envelope.level = 1;
        assert_eq!(bus.dispatch(envelope).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let bus = CommandBus::new();
        bus.register(CommandSpec::new("fail", "Always fails", 0), fail)
            .await
            .unwrap();

        let err = bus
            .dispatch(CommandEnvelope::internal("test", "fail", Value::Null))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handler broke"));
    }

    #[tokio::test]
    async fn test_closure_handler_captures_state() {
        let bus = CommandBus::new();
        let prefix = Arc::new(String::from("svc-"));
        bus.register(
            CommandSpec::new("name", "Prefix a name", 0),
            move |envelope: CommandEnvelope| {
                let prefix = prefix.clone();
                async move {
                    let name = envelope.data.as_str().unwrap_or_default().to_string();
                    Result::Ok(json!(format!("{prefix}{name}")))
                }
            },
        )
        .await
        .unwrap();

        let result = bus
            .dispatch(CommandEnvelope::internal("test", "name", json!("meter")))
            .await
            .unwrap();
        assert_eq!(result, json!("svc-meter"));
    }

    #[tokio::test]
    async fn test_unregister_and_list() {
        let bus = CommandBus::new();
        bus.register(CommandSpec::new("b", "", 0), noop).await.unwrap();
        bus.register(CommandSpec::new("a", "", 0), noop).await.unwrap();

        let names: Vec<String> = bus.commands().await.into_iter().map(|s| s.command).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        bus.unregister("a").await.unwrap();
        let result = bus
            .dispatch(CommandEnvelope::internal("test", "a", Value::Null))
            .await;
        assert!(result.is_err());
        assert_eq!(bus.get_stats().await.registered_commands, 1);
    }

    #[tokio::test]
    async fn test_fallback_receives_unregistered_commands() {
        let bus = CommandBus::new();
        bus.register(echo_spec(0), echo).await.unwrap();
        bus.set_fallback(|envelope: CommandEnvelope| async move {
            Ok::<_, Error>(json!({"forwarded": envelope.command, "level": envelope.level}))
        })
        .await;

        let mut unknown = CommandEnvelope::internal("test", "deviceAction", Value::Null);
        unknown.level = 5;
        let result = bus.dispatch(unknown).await.unwrap();
        assert_eq!(result, json!({"forwarded": "deviceAction", "level": 5}));

        // Registered commands keep their level check.
        let mut echo = CommandEnvelope::internal("test", "echo", json!(1));
        echo.level = 5;
        assert_eq!(bus.dispatch(echo).await.unwrap_err().code(), "ACCESS_DENIED");
        assert!(bus.commands().await.iter().all(|spec| spec.command == "echo"));
    }
}
