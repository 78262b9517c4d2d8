//! Connection-lifecycle core of the kiln build server.
//!
//! A transport is framed by the [`codec`], pumped into a channel, fanned out
//! to a bounded pool of [`BuildHandler`] workers, and torn down exactly once
//! however the connection ends. Teardown schedules a sweep of client
//! directories nobody owns any more.

pub mod codec;
pub mod frame;
pub mod protocol;

mod connection;
mod dispatcher;
mod handler;
mod inflight;
mod lifecycle;
mod pump;
mod reaper;
mod registry;
mod server;
mod state;
mod transport;
mod writer;

pub use connection::{
    ConnectionContext, ConnectionControl, ConnectionOutcome, serve_connection,
};
pub use dispatcher::{DEFAULT_WORKERS, DispatchStats};
pub use frame::{Frame, FrameError, FrameKind};
pub use handler::{BuildHandler, HandlerError};
pub use inflight::{InFlightGuard, InFlightTasks};
pub use lifecycle::{ControlError, Lifecycle, LifecycleState, TeardownReason};
pub use pump::PumpExit;
pub use reaper::{DEFAULT_REAPER_DELAY, ReapReport, Reaper, ReaperJob};
pub use registry::{ClientRegistry, RegistryError};
pub use server::{AcceptMode, BspServer, ServerError, ServerSettings};
pub use state::SharedState;
pub use transport::{
    BoundAddress, BoxedReader, BoxedWriter, BspListener, DEFAULT_BACKLOG, Endpoint, Transport,
    TransportError,
};
