//! Worker unit body.
//!
//! Every launcher runs the same sequence inside the unit: parse the startup
//! payload, let a [`ServiceLoader`] build the worker's local command bus,
//! signal "loaded", then serve supervisor messages until terminated.

use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{WorkerProvider, WorkerStartup};
use crate::commbus::CommandRouter;
use crate::types::ErrorReport;
use crate::workers::codec::{self, FRAME_STARTUP};
use crate::workers::WorkerMessage;

/// Builds the command bus a worker serves.
///
/// The returned router receives every command the supervisor sends, starting
/// with `serviceStart` or `serviceCheck`. A load error is reported as the
/// worker's fatal failure and ends the unit.
#[async_trait]
pub trait ServiceLoader: Send + Sync {
    async fn load(
        &self,
        startup: &WorkerStartup,
        provider: &WorkerProvider,
    ) -> std::result::Result<Arc<dyn CommandRouter>, ErrorReport>;
}

/// Run a worker unit until `shutdown` is cancelled or the supervisor side of
/// the channel closes.
pub async fn run_worker(
    startup: Value,
    loader: Arc<dyn ServiceLoader>,
    inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    shutdown: CancellationToken,
) {
    let startup = match WorkerStartup::from_value(startup) {
        Ok(startup) => startup,
        Err(err) => {
            tracing::error!(error = %err, "invalid worker startup payload");
            let _ = outbound.send(WorkerMessage::fatal(err.to_report()));
            return;
        }
    };

    let span = tracing::info_span!(
        "worker",
        container = %startup.container_id,
        worker_id = startup.id
    );
    let provider = WorkerProvider::new(startup, outbound, shutdown.clone());

    async move {
        let loaded = tokio::select! {
            _ = shutdown.cancelled() => return,
            loaded = loader.load(provider.startup(), &provider) => loaded,
        };
        let bus = match loaded {
            Ok(bus) => bus,
            Err(report) => {
                provider.crash(report);
                return;
            }
        };

        if provider.loaded().is_err() {
            return;
        }
        tracing::debug!("worker loaded");

        provider.serve(inbound, bus).await;
        tracing::debug!("worker finished");
    }
    .instrument(span)
    .await
}

/// Run a worker over a framed byte stream.
///
/// The first frame must carry the startup payload. Returns when the peer
/// closes the stream or the worker ends.
pub async fn serve_stream<R, W>(
    mut reader: R,
    mut writer: W,
    loader: Arc<dyn ServiceLoader>,
    max_frame_bytes: u32,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let startup: Value = codec::read_value(&mut reader, FRAME_STARTUP, max_frame_bytes)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "missing startup frame"))?;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let shutdown = CancellationToken::new();

    let writing = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            codec::write_message(&mut writer, &message).await?;
        }
        Ok::<_, io::Error>(())
    });

    let reading = tokio::spawn(async move {
        loop {
            match codec::read_message(&mut reader, max_frame_bytes).await {
                Ok(Some(message)) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "worker stream read failed");
                    break;
                }
            }
        }
    });

    run_worker(startup, loader, inbound_rx, outbound_tx, shutdown).await;
    reading.abort();

    match writing.await {
        Ok(result) => result,
        Err(err) => Err(io::Error::other(err)),
    }
}

/// Run a worker on this process's stdin/stdout.
pub async fn run_stdio_worker(
    loader: Arc<dyn ServiceLoader>,
    max_frame_bytes: u32,
) -> io::Result<()> {
    serve_stream(tokio::io::stdin(), tokio::io::stdout(), loader, max_frame_bytes).await
}
