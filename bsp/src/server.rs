//! Accept loop: binds the endpoint and serves each accepted transport as
//! its own connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::connection::{
    ConnectionContext, ConnectionControl, ConnectionOutcome, serve_connection,
};
use crate::handler::BuildHandler;
use crate::reaper::Reaper;
use crate::registry::ClientRegistry;
use crate::state::SharedState;
use crate::transport::{BoundAddress, BspListener, Endpoint, TransportError};

/// Pause after a failed `accept()` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcceptMode {
    /// Accept connections until shut down, serving them concurrently.
    #[default]
    Loop,
    /// Serve exactly one connection, then return.
    Single,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub endpoint: Endpoint,
    pub workers: usize,
    pub reaper_delay: Duration,
    pub clients_dir: PathBuf,
    pub accept: AcceptMode,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct BspServer<S> {
    settings: ServerSettings,
    registry: Arc<ClientRegistry>,
    state: SharedState<S>,
}

impl<S: Clone + Send + Sync + 'static> BspServer<S> {
    #[must_use]
    pub fn new(
        settings: ServerSettings,
        registry: Arc<ClientRegistry>,
        state: SharedState<S>,
    ) -> Self {
        Self {
            settings,
            registry,
            state,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn state(&self) -> &SharedState<S> {
        &self.state
    }

    /// Bind and serve until `shutdown` is cancelled (or, in
    /// [`AcceptMode::Single`], until the first connection ends).
    ///
    /// Only a bind failure is returned as an error. `started` receives the
    /// bound address before the first `accept()`. Returns the final build
    /// state once every connection has closed.
    pub async fn serve<H, F>(
        self,
        factory: F,
        started: Option<oneshot::Sender<BoundAddress>>,
        shutdown: CancellationToken,
    ) -> Result<S, ServerError>
    where
        H: BuildHandler,
        F: Fn(ConnectionControl, SharedState<S>) -> H + Send + Sync + 'static,
    {
        let listener = BspListener::bind(&self.settings.endpoint).await?;
        let address = listener.address().clone();
        tracing::info!(
            address = %address,
            workers = self.settings.workers,
            mode = ?self.settings.accept,
            "Build server listening"
        );
        if let Some(started) = started
            && started.send(address).is_err()
        {
            tracing::debug!("Startup listener went away");
        }

        let factory = Arc::new(factory);
        let reaper = Reaper::new(
            Arc::clone(&self.registry),
            self.settings.clients_dir.clone(),
            self.settings.reaper_delay,
        );
        let mut connections: JoinSet<ConnectionOutcome> = JoinSet::new();
        let mut next_connection: u64 = 0;

        loop {
            while let Some(joined) = connections.try_join_next() {
                log_connection_end(joined);
            }

            let transport = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(transport) => transport,
                    Err(e) => {
                        tracing::warn!("{e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            next_connection += 1;
            let connection = next_connection;
            let peer = transport.describe();
            tracing::info!(connection, peer = %peer, "Accepted connection");

            let (reader, writer) = transport.into_split();
            let ctx = ConnectionContext {
                registry: Arc::clone(&self.registry),
                reaper: reaper.clone(),
                workers: self.settings.workers,
                shutdown: shutdown.child_token(),
            };
            let factory = Arc::clone(&factory);
            let state = self.state.clone();
            let span = tracing::info_span!("connection", id = connection);
            let served = serve_connection(reader, writer, ctx, move |control| {
                factory(control, state)
            })
            .instrument(span);

            if self.settings.accept == AcceptMode::Single {
                log_connection_end(Ok(served.await));
                break;
            }
            connections.spawn(served);
        }

        drop(listener);
        while let Some(joined) = connections.join_next().await {
            log_connection_end(joined);
        }
        tracing::info!("Build server stopped");
        Ok(self.state.snapshot())
    }
}

fn log_connection_end(joined: Result<ConnectionOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => tracing::debug!(
            client = ?outcome.client(),
            reason = ?outcome.reason(),
            "Connection finished"
        ),
        Err(e) => tracing::error!("Connection task failed: {e}"),
    }
}
