//! In-process worker units.
//!
//! Each worker runs [`run_worker`] as its own tokio task. A forwarder task
//! relays what the unit posts to the supervisor's event channel and reports
//! the unit's end: a panic becomes an error event, and `Exit` is always sent
//! last, after every message the unit managed to post.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::launcher::{WorkerEvent, WorkerEvents, WorkerLauncher, WorkerLink};
use super::message::WorkerMessage;
use crate::types::{Error, ErrorReport, Result, WorkerId};
use crate::worker::{panic_message, run_worker, ServiceLoader};

/// Code reported when a worker unit panics outside a command handler.
pub const WORKER_PANIC: &str = "WORKER_PANIC";

/// Launches workers as tokio tasks sharing the host runtime.
pub struct TaskLauncher {
    loader: Arc<dyn ServiceLoader>,
}

impl TaskLauncher {
    pub fn new(loader: Arc<dyn ServiceLoader>) -> Self {
        Self { loader }
    }
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher").finish_non_exhaustive()
    }
}

struct TaskLink {
    id: WorkerId,
    inbound: mpsc::UnboundedSender<WorkerMessage>,
    shutdown: CancellationToken,
}

impl WorkerLink for TaskLink {
    fn post(&self, message: WorkerMessage) -> Result<()> {
        self.inbound
            .send(message)
            .map_err(|_| Error::WorkerGone(self.id))
    }

    fn terminate(&mut self) {
        self.shutdown.cancel();
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch(
        &self,
        id: WorkerId,
        startup: Value,
        events: WorkerEvents,
    ) -> Result<Box<dyn WorkerLink>> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let unit = tokio::spawn(run_worker(
            startup,
            Arc::clone(&self.loader),
            inbound_rx,
            outbound_tx,
            shutdown.clone(),
        ));
        tokio::spawn(forward(id, unit, outbound_rx, events));

        tracing::debug!(worker_id = %id, "task worker launched");
        Ok(Box::new(TaskLink {
            id,
            inbound: inbound_tx,
            shutdown,
        }))
    }
}

async fn forward(
    id: WorkerId,
    mut unit: JoinHandle<()>,
    mut outbound: mpsc::UnboundedReceiver<WorkerMessage>,
    events: WorkerEvents,
) {
    let joined = loop {
        tokio::select! {
            biased;
            Some(message) = outbound.recv() => {
                let _ = events.send((id, WorkerEvent::Message(message)));
            }
            joined = &mut unit => break joined,
        }
    };

    while let Ok(message) = outbound.try_recv() {
        let _ = events.send((id, WorkerEvent::Message(message)));
    }

    if let Err(err) = joined {
        if err.is_panic() {
            let panic_msg = panic_message(err.into_panic().as_ref());
            tracing::error!(worker_id = %id, panic = %panic_msg, "worker unit panicked");
            let _ = events.send((
                id,
                WorkerEvent::Error(ErrorReport::new(
                    WORKER_PANIC,
                    format!("worker panicked: {panic_msg}"),
                )),
            ));
        }
    }

    tracing::debug!(worker_id = %id, "task worker exited");
    let _ = events.send((id, WorkerEvent::Exit));
}
