//! Native worker units and how they are launched.
//!
//! A [`WorkerLauncher`] creates the unit a worker runs in and hands back a
//! [`WorkerLink`] the supervisor uses to post messages and to terminate it.
//! Everything the unit says travels back as a [`WorkerEvent`] on the
//! supervisor's event channel.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::message::WorkerMessage;
use crate::types::{ErrorReport, Result, WorkerId};

/// Something that happened inside (or to) a worker unit.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A message posted by the worker.
    Message(WorkerMessage),
    /// A native failure of the unit (panic, broken channel, bad frame).
    Error(ErrorReport),
    /// The unit is gone. Sent exactly once, always last.
    Exit,
}

/// Sender every unit reports its events on.
pub type WorkerEvents = mpsc::UnboundedSender<(WorkerId, WorkerEvent)>;

/// The supervisor's side of a live unit.
pub trait WorkerLink: Send {
    /// Post a message to the worker. FIFO per link.
    fn post(&self, message: WorkerMessage) -> Result<()>;

    /// Ask the unit to stop. Its `Exit` event follows asynchronously.
    fn terminate(&mut self);
}

/// Creates native worker units.
pub trait WorkerLauncher: Send + Sync {
    /// Launch a unit for `id`. `startup` is the startup payload, already
    /// stamped with `__index` and `__id`.
    fn launch(&self, id: WorkerId, startup: Value, events: WorkerEvents)
        -> Result<Box<dyn WorkerLink>>;
}

/// Launchers used by a supervisor: one shared by default, optionally a
/// separate one for services that ask to be isolated.
#[derive(Clone)]
pub struct Launchers {
    pub shared: Arc<dyn WorkerLauncher>,
    pub isolated: Option<Arc<dyn WorkerLauncher>>,
}

impl Launchers {
    pub fn new(shared: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            shared,
            isolated: None,
        }
    }

    pub fn with_isolated(mut self, isolated: Arc<dyn WorkerLauncher>) -> Self {
        self.isolated = Some(isolated);
        self
    }

    pub(crate) fn pick(&self, isolated: bool) -> &Arc<dyn WorkerLauncher> {
        match (&self.isolated, isolated) {
            (Some(launcher), true) => launcher,
            _ => &self.shared,
        }
    }
}

impl fmt::Debug for Launchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launchers")
            .field("isolated", &self.isolated.is_some())
            .finish_non_exhaustive()
    }
}
