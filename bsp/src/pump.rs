//! Message pump: transport bytes in, classified frames out.

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::FrameReader;
use crate::frame::Frame;

/// Why the pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The client closed the stream between frames.
    Eof,
    /// Malformed frame or read failure. Treated like EOF for teardown.
    Failed(String),
    /// The transport was closed by teardown.
    Stopped,
    /// The dispatcher went away before or while frames were flowing.
    DispatcherGone,
}

impl PumpExit {
    /// Whether the client side ended the stream (as opposed to the server
    /// closing it).
    #[must_use]
    pub fn is_client_side(&self) -> bool {
        matches!(self, Self::Eof | Self::Failed(_))
    }
}

/// Read frames until the stream ends, publishing each one before reading the
/// next.
///
/// Nothing is read until the dispatcher reports it has subscribed, so the
/// first frame (normally `build/initialize`) cannot be lost. When the stream
/// ends the channel is closed first, then `on_finish` runs with the exit
/// reason.
pub(crate) async fn run_pump<R, F>(
    mut reader: FrameReader<R>,
    subscribed: oneshot::Receiver<()>,
    frames: mpsc::UnboundedSender<Frame>,
    stop: CancellationToken,
    on_finish: F,
) -> PumpExit
where
    R: AsyncRead + Unpin,
    F: FnOnce(&PumpExit),
{
    let exit = pump_frames(&mut reader, subscribed, &frames, &stop).await;
    drop(frames);

    match &exit {
        PumpExit::Eof => tracing::info!("Client closed the connection"),
        PumpExit::Failed(err) => tracing::warn!(error = %err, "Stopped reading from client"),
        PumpExit::Stopped => tracing::debug!("Pump stopped by teardown"),
        PumpExit::DispatcherGone => tracing::warn!("Dispatcher stopped before the pump"),
    }

    on_finish(&exit);
    exit
}

async fn pump_frames<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    subscribed: oneshot::Receiver<()>,
    frames: &mpsc::UnboundedSender<Frame>,
    stop: &CancellationToken,
) -> PumpExit {
    tokio::select! {
        biased;
        () = stop.cancelled() => return PumpExit::Stopped,
        ready = subscribed => {
            if ready.is_err() {
                return PumpExit::DispatcherGone;
            }
        }
    }

    loop {
        let read = tokio::select! {
            biased;
            () = stop.cancelled() => return PumpExit::Stopped,
            read = reader.read_frame() => read,
        };

        match read {
            Ok(Some(frame)) => {
                tracing::trace!(method = ?frame.method(), "Frame received");
                if frames.send(frame).is_err() {
                    return PumpExit::DispatcherGone;
                }
            }
            Ok(None) => return PumpExit::Eof,
            Err(e) => return PumpExit::Failed(format!("{e:#}")),
        }
    }
}
