//! Supervisor-side record of one live worker.

use std::collections::BTreeSet;
use std::fmt;

use super::launcher::WorkerLink;
use super::message::WorkerMessage;
use crate::types::{ErrorReport, Result, WorkerId};

pub type ErrorCallback = Box<dyn Fn(WorkerId, ErrorReport) + Send + Sync>;
pub type ExitCallback = Box<dyn FnOnce(WorkerId) + Send + Sync>;

/// Callbacks of the party that spawned a worker.
///
/// `on_error` may fire any number of times; `on_exit` fires once, after every
/// outstanding call of the worker has been rejected.
pub struct WorkerCallbacks {
    pub on_error: ErrorCallback,
    pub on_exit: ExitCallback,
}

impl WorkerCallbacks {
    pub fn new(
        on_error: impl Fn(WorkerId, ErrorReport) + Send + Sync + 'static,
        on_exit: impl FnOnce(WorkerId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_error: Box::new(on_error),
            on_exit: Box::new(on_exit),
        }
    }

    /// Callbacks that do nothing.
    pub fn noop() -> Self {
        Self::new(|_, _| {}, |_| {})
    }
}

impl fmt::Debug for WorkerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCallbacks").finish_non_exhaustive()
    }
}

pub struct WorkerHandle {
    pub id: WorkerId,
    link: Box<dyn WorkerLink>,
    /// Correlation indices registered against this worker, oldest first.
    outstanding: BTreeSet<u64>,
    callbacks: WorkerCallbacks,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, link: Box<dyn WorkerLink>, callbacks: WorkerCallbacks) -> Self {
        Self {
            id,
            link,
            outstanding: BTreeSet::new(),
            callbacks,
        }
    }

    pub fn post(&self, message: WorkerMessage) -> Result<()> {
        self.link.post(message)
    }

    pub fn terminate(&mut self) {
        self.link.terminate();
    }

    pub fn track(&mut self, index: u64) {
        self.outstanding.insert(index);
    }

    /// Stop tracking an index. Returns whether it belonged to this worker.
    pub fn untrack(&mut self, index: u64) -> bool {
        self.outstanding.remove(&index)
    }

    pub fn owns(&self, index: u64) -> bool {
        self.outstanding.contains(&index)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn report_error(&self, report: ErrorReport) {
        (self.callbacks.on_error)(self.id, report);
    }

    /// Consume the handle: outstanding indices in order, then the exit callback.
    pub fn into_exit(self) -> (Vec<u64>, ExitCallback) {
        (self.outstanding.into_iter().collect(), self.callbacks.on_exit)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct NullLink;

    impl WorkerLink for NullLink {
        fn post(&self, _message: WorkerMessage) -> Result<()> {
            Ok(())
        }

        fn terminate(&mut self) {}
    }

    #[test]
    fn test_exit_yields_indices_in_order_then_callback() {
        let exited = Arc::new(Mutex::new(None));
        let seen = exited.clone();
        let callbacks = WorkerCallbacks::new(|_, _| {}, move |id| *seen.lock() = Some(id));

        let mut handle = WorkerHandle::new(WorkerId::new(4), Box::new(NullLink), callbacks);
        for index in [9, 2, 5] {
            handle.track(index);
        }
        assert!(handle.untrack(5));
        assert!(!handle.untrack(5));
        assert!(handle.owns(2));

        let (indices, on_exit) = handle.into_exit();
        assert_eq!(indices, vec![2, 9]);
        assert!(exited.lock().is_none());
        on_exit(WorkerId::new(4));
        assert_eq!(*exited.lock(), Some(WorkerId::new(4)));
    }

    #[test]
    fn test_report_error_passes_worker_id() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let callbacks = WorkerCallbacks::new(
            move |id, report: ErrorReport| sink.lock().push((id, report.code)),
            |_| {},
        );
        let handle = WorkerHandle::new(WorkerId::new(1), Box::new(NullLink), callbacks);
        handle.report_error(ErrorReport::new("E1", "boom"));
        assert_eq!(reports.lock().as_slice(), &[(WorkerId::new(1), "E1".to_string())]);
    }
}
