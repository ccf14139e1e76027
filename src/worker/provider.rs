//! Worker-side end of the supervisor channel.
//!
//! [`WorkerProvider`] lives inside a worker unit. It serves commands coming
//! from the supervisor on the worker's local command bus and lets service code
//! escalate commands to the host, emit broadcasts, and report a crash.
//!
//! Escalations are correlated with the worker's own `iIndex` counter, which is
//! independent of the supervisor's `__index` counter; the `internal` flag tells
//! the two namespaces apart on the shared channel.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::recovery::with_recovery;
use super::WorkerStartup;
use crate::commbus::{CommandEnvelope, CommandRouter};
use crate::types::{Error, ErrorReport, Result};
use crate::workers::{CorrelationTable, ReplyStatus, WorkerMessage};

/// Provider type stamped on commands that arrive from the supervisor.
pub const SUPERVISOR_PROVIDER: &str = "WorkersManager";

#[derive(Clone)]
pub struct WorkerProvider {
    inner: Arc<Inner>,
}

struct Inner {
    startup: WorkerStartup,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    pending: Mutex<CorrelationTable>,
    shutdown: CancellationToken,
}

impl WorkerProvider {
    pub fn new(
        startup: WorkerStartup,
        outbound: mpsc::UnboundedSender<WorkerMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                startup,
                outbound,
                pending: Mutex::new(CorrelationTable::new()),
                shutdown,
            }),
        }
    }

    pub fn startup(&self) -> &WorkerStartup {
        &self.inner.startup
    }

    /// Token cancelled when the unit is ending.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Signal the supervisor that the worker finished loading.
    ///
    /// Resolves the supervisor's spawn call with the worker id.
    pub fn loaded(&self) -> Result<()> {
        let startup = &self.inner.startup;
        self.send_raw(WorkerMessage {
            index: Some(startup.index),
            worker_id: Some(startup.id),
            result: Some(ReplyStatus::Success),
            result_data: Some(Value::from(startup.id)),
            ..WorkerMessage::default()
        })
    }

    /// Run a command on the host and wait for its result.
    pub async fn request(&self, command: impl Into<String>, data: Value) -> Result<Value> {
        let command = command.into();
        let (index, rx) = self.inner.pending.lock().register();

        if let Err(err) = self.send_raw(WorkerMessage::escalation(command.as_str(), data, index)) {
            self.inner.pending.lock().take(index);
            return Err(err);
        }
        tracing::trace!(command = %command, index, "escalation sent");

        rx.await.map_err(|_| Error::WorkerExited)?
    }

    /// Fire-and-forget broadcast.
    pub fn broadcast(&self, channel: impl Into<String>, data: Value) -> Result<()> {
        self.send_raw(WorkerMessage::broadcast(channel, data))
    }

    /// Post a message to the supervisor as-is.
    pub fn send_raw(&self, message: WorkerMessage) -> Result<()> {
        self.inner
            .outbound
            .send(message)
            .map_err(|_| Error::internal("supervisor channel closed"))
    }

    /// Report a fatal failure and end the unit.
    pub fn crash(&self, report: ErrorReport) {
        tracing::error!(
            service = %self.inner.startup.service,
            code = %report.code,
            "worker crashed: {}",
            report.message
        );
        // The supervisor may already be gone; the unit ends either way.
        let _ = self.send_raw(WorkerMessage::fatal(report));
        self.inner.shutdown.cancel();
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Handle one message from the supervisor.
    ///
    /// Escalation replies resolve the local waiter and never reach the bus.
    /// Everything else is dispatched on `bus` in its own task; the original
    /// message is posted back carrying the outcome.
    pub fn on_parent_message(
        &self,
        message: WorkerMessage,
        bus: &Arc<dyn CommandRouter>,
        tasks: &mut JoinSet<()>,
    ) {
        if message.internal {
            self.resolve_escalation(&message);
            return;
        }

        let provider = self.clone();
        let bus = Arc::clone(bus);
        tasks.spawn(async move {
            let envelope = CommandEnvelope::internal(
                SUPERVISOR_PROVIDER,
                message.command.as_str(),
                message.data.clone(),
            );
            let command = message.command.clone();
            let outcome = with_recovery(bus.dispatch(envelope), &command).await;
            if let Err(err) = &outcome {
                tracing::debug!(command = %command, error = %err, "command failed in worker");
            }
            if provider.send_raw(message.into_reply(outcome)).is_err() {
                tracing::debug!(command = %command, "reply dropped, supervisor channel closed");
            }
        });
    }

    fn resolve_escalation(&self, message: &WorkerMessage) {
        let Some(index) = message.internal_index else {
            tracing::debug!(command = %message.command, "escalation reply without iIndex dropped");
            return;
        };
        let outcome = message
            .escalation_outcome()
            .unwrap_or_else(|| Ok(message.result_data.clone().unwrap_or(Value::Null)));
        if !self.inner.pending.lock().resolve(index, outcome) {
            tracing::debug!(index, "escalation reply for unknown index dropped");
        }
    }

    /// Serve supervisor messages until the channel closes or the unit is
    /// shut down. Handler tasks still running are aborted on return.
    pub async fn serve(
        &self,
        mut inbound: mpsc::UnboundedReceiver<WorkerMessage>,
        bus: Arc<dyn CommandRouter>,
    ) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => self.on_parent_message(message, &bus, &mut tasks),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        tracing::warn!(error = %err, "command task failed");
                    }
                }
            }
        }
        tasks.shutdown().await;
    }
}

impl std::fmt::Debug for WorkerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProvider")
            .field("startup", &self.inner.startup)
            .finish_non_exhaustive()
    }
}
