//! Child-process worker units.
//!
//! The worker executable talks to the supervisor over its stdin/stdout using
//! the frame codec: the first frame written to the child is the startup
//! payload, every later frame in either direction is a channel envelope.
//! Stderr is inherited so worker logs land next to the host's.

use serde_json::Value;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::codec::{self, DEFAULT_MAX_FRAME_BYTES, FRAME_STARTUP};
use super::launcher::{WorkerEvent, WorkerEvents, WorkerLauncher, WorkerLink};
use super::message::WorkerMessage;
use crate::types::{Error, ErrorReport, Result, WorkerId, WorkersConfig};

/// Code reported when the channel to a worker process breaks.
pub const WORKER_CHANNEL_BROKEN: &str = "WORKER_CHANNEL_BROKEN";
/// Code reported when a worker process exits unsuccessfully on its own.
pub const WORKER_EXIT_STATUS: &str = "WORKER_EXIT_STATUS";

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    max_frame_bytes: u32,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Build a launcher from config. `None` when no worker program is set.
    pub fn from_config(config: &WorkersConfig) -> Option<Self> {
        let program = config.program.clone()?;
        Some(
            Self::new(program)
                .with_args(config.args.iter().cloned())
                .with_max_frame_bytes(config.max_frame_bytes),
        )
    }
}

struct ProcessLink {
    id: WorkerId,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    kill: CancellationToken,
}

impl WorkerLink for ProcessLink {
    fn post(&self, message: WorkerMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| Error::WorkerGone(self.id))
    }

    fn terminate(&mut self) {
        self.kill.cancel();
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        id: WorkerId,
        startup: Value,
        events: WorkerEvents,
    ) -> Result<Box<dyn WorkerLink>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::spawn(format!("{}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::spawn("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn("worker stdout was not captured"))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();

        tokio::spawn(write_loop(id, stdin, startup, outbound_rx));
        tokio::spawn(supervise(
            id,
            child,
            stdout,
            kill.clone(),
            events,
            self.max_frame_bytes,
        ));

        tracing::info!(worker_id = %id, program = %self.program.display(), "worker process launched");
        Ok(Box::new(ProcessLink {
            id,
            outbound: outbound_tx,
            kill,
        }))
    }
}

async fn write_loop(
    id: WorkerId,
    mut stdin: ChildStdin,
    startup: Value,
    mut outbound: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    if let Err(err) = codec::write_value(&mut stdin, FRAME_STARTUP, &startup).await {
        tracing::debug!(worker_id = %id, error = %err, "startup frame not delivered");
        return;
    }
    while let Some(message) = outbound.recv().await {
        if let Err(err) = codec::write_message(&mut stdin, &message).await {
            tracing::debug!(worker_id = %id, error = %err, "worker stdin closed");
            break;
        }
    }
}

enum Ending {
    Terminated,
    Eof,
    Broken(std::io::Error),
}

async fn supervise(
    id: WorkerId,
    mut child: Child,
    mut stdout: ChildStdout,
    kill: CancellationToken,
    events: WorkerEvents,
    max_frame_bytes: u32,
) {
    let ending = loop {
        let read = tokio::select! {
            _ = kill.cancelled() => None,
            read = codec::read_message(&mut stdout, max_frame_bytes) => Some(read),
        };
        match read {
            None => break Ending::Terminated,
            Some(Ok(Some(message))) => {
                let _ = events.send((id, WorkerEvent::Message(message)));
            }
            Some(Ok(None)) => break Ending::Eof,
            Some(Err(err)) => break Ending::Broken(err),
        }
    };

    match ending {
        Ending::Terminated => {
            reap(&mut child).await;
        }
        Ending::Broken(err) => {
            tracing::warn!(worker_id = %id, error = %err, "worker channel broken");
            let _ = events.send((
                id,
                WorkerEvent::Error(ErrorReport::new(WORKER_CHANNEL_BROKEN, err.to_string())),
            ));
            reap(&mut child).await;
        }
        Ending::Eof => {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status.ok(),
                None => reap(&mut child).await,
            };
            if let Some(status) = status.filter(|status| !status.success()) {
                tracing::warn!(worker_id = %id, %status, "worker process failed");
                let _ = events.send((
                    id,
                    WorkerEvent::Error(ErrorReport::new(
                        WORKER_EXIT_STATUS,
                        format!("worker process exited with {status}"),
                    )),
                ));
            }
        }
    }

    tracing::debug!(worker_id = %id, "worker process exited");
    let _ = events.send((id, WorkerEvent::Exit));
}

async fn reap(child: &mut Child) -> Option<ExitStatus> {
    if let Err(err) = child.start_kill() {
        tracing::debug!(error = %err, "worker process already gone");
    }
    child.wait().await.ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn next_event(
        events: &mut mpsc::UnboundedReceiver<(WorkerId, WorkerEvent)>,
    ) -> WorkerEvent {
        events.recv().await.unwrap().1
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let (events_tx, _events) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new("/nonexistent/service-worker");
        let err = launcher
            .launch(WorkerId::new(1), Value::Null, events_tx)
            .err()
            .unwrap();
        assert_eq!(err.code(), "SPAWN_FAILED");
    }

    #[tokio::test]
    async fn test_failed_exit_status_is_reported() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new("sh").with_args(["-c", "exit 3"]);
        let _link = launcher
            .launch(WorkerId::new(1), Value::Null, events_tx)
            .unwrap();

        match next_event(&mut events).await {
            WorkerEvent::Error(report) => assert_eq!(report.code, WORKER_EXIT_STATUS),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(next_event(&mut events).await, WorkerEvent::Exit);
    }

    #[tokio::test]
    async fn test_terminate_kills_process() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new("sleep").with_args(["30"]);
        let mut link = launcher
            .launch(WorkerId::new(2), Value::Null, events_tx)
            .unwrap();

        link.terminate();
        assert_eq!(next_event(&mut events).await, WorkerEvent::Exit);
    }

    #[test]
    fn test_from_config_requires_program() {
        assert!(ProcessLauncher::from_config(&WorkersConfig::default()).is_none());

        let config = WorkersConfig {
            program: Some(PathBuf::from("/usr/bin/worker")),
            args: vec!["--stdio".to_string()],
            max_frame_bytes: 1024,
        };
        let launcher = ProcessLauncher::from_config(&config).unwrap();
        assert_eq!(launcher.args, vec!["--stdio".to_string()]);
        assert_eq!(launcher.max_frame_bytes, 1024);
    }
}
