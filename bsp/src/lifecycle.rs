//! Connection lifecycle controller.
//!
//! Every way a connection can end funnels into [`Lifecycle::teardown`]. An
//! atomic compare-and-set lets exactly one caller run the teardown body; all
//! later or concurrent callers return `false` without side effects.
//!
//! ```text
//! Active ──teardown(reason)──▶ TearingDown ──body done──▶ Closed
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::{fmt, io};

use kiln_types::ClientId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::inflight::InFlightTasks;
use crate::reaper::{ReapReport, Reaper, ReaperJob};
use crate::registry::{ClientRegistry, RegistryError};

const ACTIVE: u8 = 0;
const TEARING_DOWN: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    TearingDown,
    Closed,
}

/// What started the teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Handler logic saw an exit/disconnect message.
    ExitRequested,
    /// External cancellation, e.g. the server shutting down.
    Cancelled,
    /// The client stream ended without an exit message.
    PumpFinished,
    /// The dispatcher's worker pool failed.
    DispatcherFailed,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExitRequested => "exit requested",
            Self::Cancelled => "cancelled",
            Self::PumpFinished => "client stream ended",
            Self::DispatcherFailed => "dispatcher failed",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("connection is closed")]
    Closed,
    #[error("connection already identified as client {0}")]
    AlreadyIdentified(ClientId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("creating client directory {}: {source}", path.display())]
    CreateDirectory {
        path: PathBuf,
        source: io::Error,
    },
}

/// Identity bookkeeping for the client on this connection.
#[derive(Debug, Clone)]
enum ClientSlot {
    Unknown,
    Registered(ClientId),
    /// Unregistered by handler logic before teardown.
    Departed(ClientId),
}

/// Owns the teardown state machine for one connection.
pub struct Lifecycle {
    active: AtomicBool,
    state: AtomicU8,
    teardowns: AtomicUsize,
    reason: OnceLock<TeardownReason>,
    in_flight: Arc<InFlightTasks>,
    subscription: CancellationToken,
    transport: CancellationToken,
    closed: CancellationToken,
    client: Mutex<ClientSlot>,
    registry: Arc<ClientRegistry>,
    reaper: Reaper,
    reap: Mutex<Option<JoinHandle<ReapReport>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Lifecycle {
    #[must_use]
    pub fn new(
        in_flight: Arc<InFlightTasks>,
        registry: Arc<ClientRegistry>,
        reaper: Reaper,
    ) -> Self {
        Self {
            active: AtomicBool::new(true),
            state: AtomicU8::new(ACTIVE),
            teardowns: AtomicUsize::new(0),
            reason: OnceLock::new(),
            in_flight,
            subscription: CancellationToken::new(),
            transport: CancellationToken::new(),
            closed: CancellationToken::new(),
            client: Mutex::new(ClientSlot::Unknown),
            registry,
            reaper,
            reap: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => LifecycleState::Active,
            TEARING_DOWN => LifecycleState::TearingDown,
            _ => LifecycleState::Closed,
        }
    }

    /// Reason recorded by the teardown that ran, if any.
    #[must_use]
    pub fn reason(&self) -> Option<TeardownReason> {
        self.reason.get().copied()
    }

    /// How many times the teardown body has run. Never more than one.
    #[must_use]
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }

    /// Token the dispatcher consumes frames under.
    #[must_use]
    pub fn subscription(&self) -> CancellationToken {
        self.subscription.clone()
    }

    /// Token observed by the pump and the writer; cancelled to close the
    /// transport.
    #[must_use]
    pub fn transport(&self) -> CancellationToken {
        self.transport.clone()
    }

    /// Resolves once the connection reaches [`LifecycleState::Closed`].
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Identify this connection as `client`, owning `directory`.
    ///
    /// Returns `true` when this call added the registry entry and `false`
    /// when the connection already held it. Fails once teardown has started,
    /// so a late registration can never leak past the sweep, and fails while
    /// another live connection holds the same identity.
    pub fn bind_client(&self, client: ClientId, directory: PathBuf) -> Result<bool, ControlError> {
        let mut slot = lock(&self.client);
        if !self.is_active() {
            return Err(ControlError::Closed);
        }
        match &*slot {
            ClientSlot::Registered(existing) | ClientSlot::Departed(existing)
                if *existing != client =>
            {
                return Err(ControlError::AlreadyIdentified(existing.clone()));
            }
            ClientSlot::Departed(_) => return Err(ControlError::Closed),
            ClientSlot::Registered(_) => return Ok(false),
            ClientSlot::Unknown => {}
        }
        self.registry.claim(client.clone(), directory)?;
        *slot = ClientSlot::Registered(client);
        Ok(true)
    }

    /// Undo a [`bind_client`](Self::bind_client) whose follow-up work failed,
    /// leaving the connection unidentified.
    pub(crate) fn unbind_client(&self, client: &ClientId) {
        let mut slot = lock(&self.client);
        if matches!(&*slot, ClientSlot::Registered(bound) if bound == client) {
            self.registry.unregister(client);
            *slot = ClientSlot::Unknown;
        }
    }

    /// Remove this connection's client from the registry and hand back its
    /// identity. Only the first call returns `Some`.
    pub fn release_client(&self) -> Option<ClientId> {
        let mut slot = lock(&self.client);
        let ClientSlot::Registered(client) = &*slot else {
            return None;
        };
        let client = client.clone();
        self.registry.unregister(&client);
        *slot = ClientSlot::Departed(client.clone());
        Some(client)
    }

    /// Identity currently bound to this connection, registered or departed.
    #[must_use]
    pub fn client(&self) -> Option<ClientId> {
        match &*lock(&self.client) {
            ClientSlot::Unknown => None,
            ClientSlot::Registered(client) | ClientSlot::Departed(client) => Some(client.clone()),
        }
    }

    /// Take the handle of the reaper job scheduled by teardown.
    pub fn take_reaper(&self) -> Option<JoinHandle<ReapReport>> {
        lock(&self.reap).take()
    }

    /// Start teardown. Returns `true` only for the call that ran the body.
    pub fn teardown(&self, reason: TeardownReason) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(%reason, "Teardown already started");
            return false;
        }
        self.state.store(TEARING_DOWN, Ordering::Release);
        self.teardowns.fetch_add(1, Ordering::AcqRel);
        let _ = self.reason.set(reason);

        match reason {
            TeardownReason::Cancelled => tracing::info!("Connection cancelled"),
            TeardownReason::DispatcherFailed => {
                tracing::warn!(%reason, "Tearing down connection");
            }
            TeardownReason::ExitRequested | TeardownReason::PumpFinished => {
                tracing::info!(%reason, "Tearing down connection");
            }
        }

        let cancelled = self.in_flight.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled in-flight handlers");
        }
        self.subscription.cancel();
        self.transport.cancel();

        let job = self.reaper_job();
        if let Some(handle) = self.reaper.schedule(job) {
            *lock(&self.reap) = Some(handle);
        }

        self.state.store(CLOSED, Ordering::Release);
        self.closed.cancel();
        true
    }

    fn reaper_job(&self) -> ReaperJob {
        let disconnected = {
            let mut slot = lock(&self.client);
            match slot.clone() {
                ClientSlot::Unknown => None,
                ClientSlot::Departed(client) => Some(client),
                ClientSlot::Registered(client) => {
                    self.registry.unregister(&client);
                    *slot = ClientSlot::Departed(client.clone());
                    Some(client)
                }
            }
        };
        ReaperJob::new(self.registry.snapshot(), disconnected)
    }
}
