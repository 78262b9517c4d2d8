//! Serialized response writer.
//!
//! One task owns the write half of the transport and drains a queue, so
//! responses from concurrent workers never interleave on the wire.

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::FrameWriter;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Queue handle given to dispatcher workers.
#[derive(Clone)]
pub(crate) struct ResponseSender {
    tx: mpsc::Sender<serde_json::Value>,
}

impl ResponseSender {
    /// Queue `msg` for writing. Returns `false` once the transport is closed.
    pub async fn send(&self, msg: serde_json::Value) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriterExit {
    pub written: u64,
    pub failed: bool,
}

/// Spawn the writer task. Cancelling `close` stops it and shuts the stream
/// down; queued but unwritten messages are discarded.
pub(crate) fn spawn_writer<W>(
    writer: W,
    close: CancellationToken,
) -> (ResponseSender, JoinHandle<WriterExit>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<serde_json::Value>(WRITER_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        let mut exit = WriterExit {
            written: 0,
            failed: false,
        };

        loop {
            let msg = tokio::select! {
                biased;
                () = close.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(e) = writer.write_value(&msg).await {
                tracing::warn!("Transport write error: {e:#}");
                exit.failed = true;
                break;
            }
            exit.written += 1;
        }

        // Closing is pure resource release; a peer that already hung up is fine.
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Ignoring transport shutdown error: {e:#}");
        }
        exit
    });

    (ResponseSender { tx }, handle)
}
