//! One client connection: wires the pump, dispatcher, and writer to a
//! [`Lifecycle`] and runs until teardown completes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_types::ClientId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::FrameReader;
use crate::dispatcher::{DispatchExit, DispatchStats, Dispatcher};
use crate::handler::BuildHandler;
use crate::inflight::InFlightTasks;
use crate::lifecycle::{ControlError, Lifecycle, TeardownReason};
use crate::pump::{PumpExit, run_pump};
use crate::reaper::{ReapReport, Reaper};
use crate::registry::ClientRegistry;
use crate::writer::spawn_writer;

/// Handle given to handler logic for identity and exit control.
#[derive(Clone)]
pub struct ConnectionControl {
    lifecycle: Arc<Lifecycle>,
    clients_dir: PathBuf,
}

impl ConnectionControl {
    /// Identify the connection as `client`, creating `<clients_dir>/<client>`.
    pub async fn register_client(&self, client: ClientId) -> Result<PathBuf, ControlError> {
        if !self.lifecycle.is_active() {
            return Err(ControlError::Closed);
        }
        let directory = self.clients_dir.join(client.as_str());
        // Registered before the directory exists, so a sweep still pending
        // from an earlier connection sees the owner and leaves it alone.
        let bound = self.lifecycle.bind_client(client.clone(), directory.clone())?;
        if let Err(source) = tokio::fs::create_dir_all(&directory).await {
            if bound {
                self.lifecycle.unbind_client(&client);
            }
            return Err(ControlError::CreateDirectory {
                path: directory,
                source,
            });
        }
        tracing::info!(client = %client, dir = %directory.display(), "Client registered");
        Ok(directory)
    }

    /// Drop the connection's identity from the registry. Only the first call
    /// returns it.
    pub fn unregister_client(&self) -> Option<ClientId> {
        self.lifecycle.release_client()
    }

    /// Tear the connection down after an exit message. `false` if teardown
    /// had already started.
    pub fn request_exit(&self) -> bool {
        self.lifecycle.teardown(TeardownReason::ExitRequested)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    #[must_use]
    pub fn client(&self) -> Option<ClientId> {
        self.lifecycle.client()
    }

    #[must_use]
    pub fn clients_dir(&self) -> &Path {
        &self.clients_dir
    }
}

/// Server-wide resources a connection borrows.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<ClientRegistry>,
    pub reaper: Reaper,
    pub workers: usize,
    /// Cancelled when the whole server stops.
    pub shutdown: CancellationToken,
}

/// How a connection ended.
#[derive(Debug)]
pub struct ConnectionOutcome {
    reason: Option<TeardownReason>,
    client: Option<ClientId>,
    pump: PumpExit,
    dispatch: DispatchStats,
    pool_failed: bool,
    teardowns: usize,
    reaper: Option<JoinHandle<ReapReport>>,
}

impl ConnectionOutcome {
    #[must_use]
    pub fn reason(&self) -> Option<TeardownReason> {
        self.reason
    }

    #[must_use]
    pub fn client(&self) -> Option<&ClientId> {
        self.client.as_ref()
    }

    #[must_use]
    pub fn pump_exit(&self) -> &PumpExit {
        &self.pump
    }

    #[must_use]
    pub fn dispatch(&self) -> DispatchStats {
        self.dispatch
    }

    #[must_use]
    pub fn pool_failed(&self) -> bool {
        self.pool_failed
    }

    #[must_use]
    pub fn teardown_count(&self) -> usize {
        self.teardowns
    }

    /// Wait for the sweep scheduled by this connection's teardown.
    pub async fn reaped(&mut self) -> Option<ReapReport> {
        let handle = self.reaper.take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Reaper task failed: {e}");
                None
            }
        }
    }
}

/// Serve one connection to completion.
///
/// `make_handler` builds the connection's handler from its
/// [`ConnectionControl`]. Returns after teardown has run and the writer has
/// closed the transport; the reaper may still be pending.
pub async fn serve_connection<R, W, H, F>(
    reader: R,
    writer: W,
    ctx: ConnectionContext,
    make_handler: F,
) -> ConnectionOutcome
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    H: BuildHandler,
    F: FnOnce(ConnectionControl) -> H,
{
    let in_flight = Arc::new(InFlightTasks::new());
    let clients_dir = ctx.reaper.clients_dir().to_path_buf();
    let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&in_flight),
        ctx.registry,
        ctx.reaper,
    ));
    let handler = Arc::new(make_handler(ConnectionControl {
        lifecycle: Arc::clone(&lifecycle),
        clients_dir,
    }));

    let (responses, writer_task) = spawn_writer(writer, lifecycle.transport());
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let dispatcher = Dispatcher::new(handler, in_flight, responses, ctx.workers);
    let mut dispatch_task =
        tokio::spawn(dispatcher.run(frames_rx, ready_tx, lifecycle.subscription()));

    let on_finish = {
        let lifecycle = Arc::clone(&lifecycle);
        move |_: &PumpExit| {
            if lifecycle.is_active() {
                lifecycle.teardown(TeardownReason::PumpFinished);
            }
        }
    };
    let pump_task = tokio::spawn(run_pump(
        FrameReader::new(reader),
        ready_rx,
        frames_tx,
        lifecycle.transport(),
        on_finish,
    ));

    let mut dispatch_exit = None;
    tokio::select! {
        () = ctx.shutdown.cancelled() => {
            lifecycle.teardown(TeardownReason::Cancelled);
        }
        () = lifecycle.closed() => {}
        joined = &mut dispatch_task => {
            dispatch_exit = Some(settle_dispatch(joined, &lifecycle));
        }
    }

    let pump = match pump_task.await {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!("Pump task failed: {e}");
            PumpExit::Failed(e.to_string())
        }
    };
    // Normally a no-op: the pump's finish callback or another trigger won.
    lifecycle.teardown(TeardownReason::PumpFinished);
    lifecycle.closed().await;

    let dispatch_exit = match dispatch_exit {
        Some(exit) => exit,
        None => settle_dispatch(dispatch_task.await, &lifecycle),
    };

    match writer_task.await {
        Ok(exit) => tracing::debug!(written = exit.written, failed = exit.failed, "Writer closed"),
        Err(e) => tracing::warn!("Writer task failed: {e}"),
    }

    let outcome = ConnectionOutcome {
        reason: lifecycle.reason(),
        client: lifecycle.client(),
        pump,
        dispatch: dispatch_exit.stats,
        pool_failed: dispatch_exit.pool_failed,
        teardowns: lifecycle.teardown_count(),
        reaper: lifecycle.take_reaper(),
    };
    tracing::info!(
        client = ?outcome.client,
        reason = ?outcome.reason,
        frames = outcome.dispatch.frames,
        handler_errors = outcome.dispatch.handler_errors,
        "Connection closed"
    );
    outcome
}

fn settle_dispatch(
    joined: Result<DispatchExit, tokio::task::JoinError>,
    lifecycle: &Lifecycle,
) -> DispatchExit {
    let exit = joined.unwrap_or_else(|e| {
        tracing::error!("Dispatcher task failed: {e}");
        DispatchExit {
            stats: DispatchStats::default(),
            pool_failed: true,
        }
    });
    if exit.pool_failed {
        lifecycle.teardown(TeardownReason::DispatcherFailed);
    }
    exit
}
