//! Worker supervisor.
//!
//! [`WorkersManager`] is a cloneable handle to an actor task that owns every
//! [`WorkerHandle`] and the parent-side [`CorrelationTable`]. Callers talk to
//! the actor through control messages; worker units report through the event
//! channel handed to their launcher. All registry and table mutation happens
//! on the actor task, so no locks are needed.
//!
//! Inbound messages are routed in a fixed order:
//! escalation → broadcast → fatal report → correlated reply → dropped.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::correlation::{CorrelationTable, Waiter};
use super::handle::{WorkerCallbacks, WorkerHandle};
use super::launcher::{Launchers, WorkerEvent, WorkerEvents};
use super::message::{Inbound, WorkerMessage};
use crate::commbus::{BroadcastSink, CommandEnvelope, CommandRouter};
use crate::types::{Error, ErrorReport, Result, WorkerId};

/// Provider type of commands escalated by workers.
pub const ESCALATION_PROVIDER: &str = "internal";

/// Everything needed to start a worker.
#[derive(Debug)]
pub struct SpawnRequest {
    /// Startup payload; `__index` and `__id` are stamped into it.
    pub startup: Value,
    /// Prefer the isolated launcher when one is configured.
    pub isolated: bool,
    pub callbacks: WorkerCallbacks,
}

impl SpawnRequest {
    pub fn new(startup: Value, callbacks: WorkerCallbacks) -> Self {
        Self {
            startup,
            isolated: false,
            callbacks,
        }
    }

    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }
}

/// Snapshot of supervisor state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub workers: usize,
    pub pending: usize,
}

enum Control {
    Spawn {
        request: SpawnRequest,
        reply: Waiter,
        assigned: oneshot::Sender<WorkerId>,
    },
    Request {
        worker: WorkerId,
        message: WorkerMessage,
        reply: Waiter,
    },
    Terminate {
        worker: WorkerId,
        reply: Waiter,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkersManager {
    control: mpsc::UnboundedSender<Control>,
}

impl WorkersManager {
    /// Start the supervisor actor on the current runtime.
    ///
    /// Escalations are dispatched on `router`; broadcasts go to `broadcasts`.
    /// The actor stops, terminating its workers, on [`shutdown`](Self::shutdown)
    /// or once every handle is dropped. A router that itself holds a handle,
    /// such as a host bus with service commands, keeps the actor alive until
    /// `shutdown` is called.
    pub fn start(
        launchers: Launchers,
        router: Arc<dyn CommandRouter>,
        broadcasts: Arc<dyn BroadcastSink>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            launchers,
            router,
            broadcasts,
            workers: HashMap::new(),
            pending: CorrelationTable::new(),
            next_worker: 1,
            events: events_tx,
            escalation_replies: replies_tx,
        };
        tokio::spawn(supervisor.run(control_rx, events_rx, replies_rx));

        Self {
            control: control_tx,
        }
    }

    /// Launch a worker and wait for its "loaded" signal.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<WorkerId> {
        let (reply, loaded) = oneshot::channel();
        let (assigned_tx, assigned_rx) = oneshot::channel();
        self.send(Control::Spawn {
            request,
            reply,
            assigned: assigned_tx,
        })?;

        let id = assigned_rx.await.map_err(|_| stopped())?;
        loaded.await.map_err(|_| stopped())??;
        Ok(id)
    }

    /// Send a command to a worker and wait for its reply.
    pub async fn request(&self, worker: WorkerId, message: WorkerMessage) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Request {
            worker,
            message,
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    /// Terminate a worker and wait until it is gone.
    ///
    /// A worker that already exited counts as terminated.
    pub async fn terminate(&self, worker: WorkerId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Terminate { worker, reply })?;
        match rx.await.map_err(|_| stopped())? {
            Ok(_) => Ok(()),
            Err(err) if err.is_worker_exit() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn stats(&self) -> Result<WorkerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Stats { reply })?;
        rx.await.map_err(|_| stopped())
    }

    /// Terminate every worker, wait for their exits, then stop the actor.
    ///
    /// Outstanding calls are rejected with `WORKER_EXITED`; every later call
    /// on any handle fails. Shutting down a stopped supervisor is a no-op.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.send(Control::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }

    fn send(&self, control: Control) -> Result<()> {
        self.control.send(control).map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::internal("workers manager stopped")
}

struct Supervisor {
    launchers: Launchers,
    router: Arc<dyn CommandRouter>,
    broadcasts: Arc<dyn BroadcastSink>,
    workers: HashMap<WorkerId, WorkerHandle>,
    pending: CorrelationTable,
    next_worker: u64,
    events: WorkerEvents,
    escalation_replies: mpsc::UnboundedSender<(WorkerId, WorkerMessage)>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::UnboundedReceiver<(WorkerId, WorkerEvent)>,
        mut escalation_replies: mpsc::UnboundedReceiver<(WorkerId, WorkerMessage)>,
    ) {
        tracing::debug!("workers manager started");
        let mut shutdown = None;
        loop {
            // Worker events first: exits settle before new commands are accepted.
            tokio::select! {
                biased;
                Some((worker, event)) = events.recv() => self.on_event(worker, event),
                Some((worker, reply)) = escalation_replies.recv() => {
                    self.on_escalation_reply(worker, reply);
                }
                command = control.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(reply) = self.on_control(command) {
                            shutdown = Some(reply);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // Stop the workers and let their exits settle.
        for handle in self.workers.values_mut() {
            handle.terminate();
        }
        while !self.workers.is_empty() {
            match events.recv().await {
                Some((worker, event)) => self.on_event(worker, event),
                None => break,
            }
        }
        tracing::debug!("workers manager stopped");
        // Later calls must fail before the shutdown caller resumes.
        drop(control);
        drop(self);
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
    }

    fn on_control(&mut self, command: Control) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Control::Spawn {
                request,
                reply,
                assigned,
            } => self.spawn(request, reply, assigned),
            Control::Request {
                worker,
                mut message,
                reply,
            } => {
                let Some(handle) = self.workers.get_mut(&worker) else {
                    let _ = reply.send(Err(Error::WorkerGone(worker)));
                    return ControlFlow::Continue(());
                };
                let index = self.pending.insert(reply);
                handle.track(index);
                message.index = Some(index);
                tracing::trace!(worker_id = %worker, index, command = %message.command, "request posted");
                if let Err(err) = handle.post(message) {
                    // The pending exit event rejects the call.
                    tracing::debug!(worker_id = %worker, error = %err, "post to exiting worker");
                }
            }
            Control::Terminate { worker, reply } => {
                let Some(handle) = self.workers.get_mut(&worker) else {
                    let _ = reply.send(Err(Error::WorkerGone(worker)));
                    return ControlFlow::Continue(());
                };
                let index = self.pending.insert(reply);
                handle.track(index);
                handle.terminate();
                tracing::debug!(worker_id = %worker, "worker termination requested");
            }
            Control::Stats { reply } => {
                let _ = reply.send(WorkerStats {
                    workers: self.workers.len(),
                    pending: self.pending.len(),
                });
            }
            Control::Shutdown { reply } => {
                tracing::info!(workers = self.workers.len(), "workers manager shutting down");
                return ControlFlow::Break(reply);
            }
        }
        ControlFlow::Continue(())
    }

    fn spawn(
        &mut self,
        request: SpawnRequest,
        reply: Waiter,
        assigned: oneshot::Sender<WorkerId>,
    ) {
        let id = WorkerId::new(self.next_worker);
        self.next_worker = self.next_worker.wrapping_add(1).max(1);
        let index = self.pending.insert(reply);
        let _ = assigned.send(id);

        let startup = match stamp_startup(request.startup, index, id) {
            Ok(startup) => startup,
            Err(err) => {
                self.pending.resolve(index, Err(err));
                return;
            }
        };

        let launcher = self.launchers.pick(request.isolated);
        match launcher.launch(id, startup, self.events.clone()) {
            Ok(link) => {
                let mut handle = WorkerHandle::new(id, link, request.callbacks);
                handle.track(index);
                self.workers.insert(id, handle);
                tracing::info!(worker_id = %id, isolated = request.isolated, "worker spawned");
            }
            Err(err) => {
                tracing::warn!(worker_id = %id, error = %err, "worker launch failed");
                self.pending.resolve(index, Err(err));
            }
        }
    }

    fn on_event(&mut self, worker: WorkerId, event: WorkerEvent) {
        match event {
            WorkerEvent::Message(message) => self.route(worker, message),
            WorkerEvent::Error(cause) => self.report_failure(worker, cause),
            WorkerEvent::Exit => self.on_exit(worker),
        }
    }

    fn route(&mut self, worker: WorkerId, message: WorkerMessage) {
        if !self.workers.contains_key(&worker) {
            tracing::debug!(worker_id = %worker, "message from unknown worker dropped");
            return;
        }

        match message.classify() {
            Inbound::Escalation => self.escalate(worker, message),
            Inbound::Broadcast => match message.channel.as_deref() {
                Some(channel) => self.broadcasts.emit(channel, message.data),
                None => tracing::debug!(worker_id = %worker, "broadcast without channel dropped"),
            },
            Inbound::Fatal => {
                let cause = message.error.unwrap_or_else(|| {
                    ErrorReport::new("UNKNOWN", "worker reported an error without details")
                });
                self.report_failure(worker, cause);
            }
            Inbound::Reply(index) => {
                let owned = self
                    .workers
                    .get_mut(&worker)
                    .is_some_and(|handle| handle.untrack(index));
                if owned {
                    self.pending.resolve(index, message.reply_outcome());
                } else {
                    tracing::debug!(worker_id = %worker, index, "reply for foreign index dropped");
                }
            }
            Inbound::Unmatched => {
                tracing::trace!(worker_id = %worker, command = %message.command, "uncorrelated message dropped");
            }
        }
    }

    fn report_failure(&self, worker: WorkerId, cause: ErrorReport) {
        let Some(handle) = self.workers.get(&worker) else {
            tracing::debug!(worker_id = %worker, code = %cause.code, "error of unknown worker dropped");
            return;
        };
        tracing::warn!(worker_id = %worker, code = %cause.code, "worker failed: {}", cause.message);
        handle.report_error(ErrorReport::worker_internal(cause));
    }

    fn escalate(&self, worker: WorkerId, message: WorkerMessage) {
        let router = Arc::clone(&self.router);
        let replies = self.escalation_replies.clone();
        tokio::spawn(async move {
            let mut envelope = CommandEnvelope::internal(
                ESCALATION_PROVIDER,
                message.command.as_str(),
                message.data.clone(),
            );
            envelope.provider_id = worker.get();
            let outcome = router.dispatch(envelope).await;
            let _ = replies.send((worker, message.into_reply(outcome)));
        });
    }

    fn on_escalation_reply(&self, worker: WorkerId, reply: WorkerMessage) {
        match self.workers.get(&worker) {
            Some(handle) => {
                if let Err(err) = handle.post(reply) {
                    tracing::debug!(worker_id = %worker, error = %err, "escalation reply undeliverable");
                }
            }
            None => tracing::debug!(worker_id = %worker, "escalation reply for exited worker dropped"),
        }
    }

    fn on_exit(&mut self, worker: WorkerId) {
        let Some(handle) = self.workers.remove(&worker) else {
            return;
        };
        let (outstanding, on_exit) = handle.into_exit();
        let rejected = outstanding.len();
        for index in outstanding {
            self.pending.resolve(index, Err(Error::WorkerExited));
        }
        tracing::info!(worker_id = %worker, rejected, "worker exited");
        on_exit(worker);
    }
}

fn stamp_startup(startup: Value, index: u64, id: WorkerId) -> Result<Value> {
    let mut object = match startup {
        Value::Object(object) => object,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(Error::validation(format!(
                "worker startup payload must be an object, got {other}"
            )))
        }
    };
    object.insert("__index".to_string(), Value::from(index));
    object.insert("__id".to_string(), Value::from(id.get()));
    Ok(Value::Object(object))
}
