//! Load-balanced dispatcher: a fixed pool of workers draining the frame
//! channel and running the connection's [`BuildHandler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::frame::{Frame, FrameKind};
use crate::handler::{BuildHandler, HandlerError};
use crate::inflight::InFlightTasks;
use crate::protocol::Response;
use crate::writer::ResponseSender;

pub const DEFAULT_WORKERS: usize = 4;

/// How long teardown waits for cancelled handlers before detaching them.
const DETACH_GRACE: Duration = Duration::from_secs(2);

/// Counters for one connection's dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Frames taken off the channel.
    pub frames: u64,
    /// Frames that reached the handler.
    pub dispatched: u64,
    /// Handler invocations that returned an error (cancellations excluded).
    pub handler_errors: u64,
    /// `$/cancelRequest` frames that matched a running request.
    pub cancelled_requests: u64,
    /// Handler tasks still running when the dispatcher gave up waiting.
    pub detached: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchExit {
    pub stats: DispatchStats,
    pub pool_failed: bool,
}

pub(crate) struct Dispatcher<H> {
    handler: Arc<H>,
    in_flight: Arc<InFlightTasks>,
    responses: ResponseSender,
    workers: usize,
}

impl<H: BuildHandler> Dispatcher<H> {
    pub fn new(
        handler: Arc<H>,
        in_flight: Arc<InFlightTasks>,
        responses: ResponseSender,
        workers: usize,
    ) -> Self {
        Self {
            handler,
            in_flight,
            responses,
            workers: workers.max(1),
        }
    }

    /// Consume frames until the channel closes, `subscription` is cancelled,
    /// or a handler task panics.
    ///
    /// `subscribed` fires once the pool is ready; the pump reads nothing
    /// before that. Frames leave the channel in stream order, but with more
    /// than one worker their responses may be written in any order.
    pub async fn run(
        self,
        mut frames: mpsc::UnboundedReceiver<Frame>,
        subscribed: oneshot::Sender<()>,
        subscription: CancellationToken,
    ) -> DispatchExit {
        let permits = Arc::new(Semaphore::new(self.workers));
        let handler_errors = Arc::new(AtomicU64::new(0));
        let mut running = JoinSet::new();
        let mut stats = DispatchStats::default();
        let mut pool_failed = false;

        if subscribed.send(()).is_err() {
            tracing::debug!("Pump gone before dispatcher subscribed");
        }

        loop {
            let frame = tokio::select! {
                biased;
                () = subscription.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if worker_panicked(joined) {
                        pool_failed = true;
                        break;
                    }
                    continue;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            stats.frames += 1;

            match frame.kind() {
                FrameKind::CancelRequest { id } => {
                    if self.in_flight.cancel_request(id) {
                        stats.cancelled_requests += 1;
                        tracing::debug!(request_id = %id, "Request cancelled by client");
                    } else {
                        tracing::trace!(request_id = %id, "Cancel for unknown or finished request");
                    }
                    continue;
                }
                FrameKind::Response { id } => {
                    tracing::debug!(request_id = %id, "Ignoring response from client");
                    continue;
                }
                FrameKind::Request { .. } | FrameKind::Notification { .. } => {}
            }

            let permit = tokio::select! {
                biased;
                () = subscription.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::error!("Dispatcher worker pool closed");
                        pool_failed = true;
                        break;
                    }
                },
            };

            let token = CancellationToken::new();
            let guard = self
                .in_flight
                .insert(token.clone(), frame.request_id().cloned());
            stats.dispatched += 1;

            let handler = Arc::clone(&self.handler);
            let responses = self.responses.clone();
            let errors = Arc::clone(&handler_errors);
            running.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                run_worker(handler.as_ref(), frame, token, &responses, &errors).await;
            });
        }

        let drained = tokio::time::timeout(DETACH_GRACE, async {
            let mut panicked = false;
            while let Some(joined) = running.join_next().await {
                panicked |= worker_panicked(joined);
            }
            panicked
        })
        .await;
        match drained {
            Ok(panicked) => pool_failed |= panicked,
            Err(_) => {
                stats.detached = running.len() as u64;
                tracing::warn!(
                    remaining = stats.detached,
                    "Detaching handlers that ignored cancellation"
                );
                running.detach_all();
            }
        }

        self.handler.await_running_tasks().await;

        stats.handler_errors = handler_errors.load(Ordering::Acquire);
        DispatchExit { stats, pool_failed }
    }
}

fn worker_panicked(joined: Result<(), JoinError>) -> bool {
    match joined {
        Ok(()) => false,
        Err(err) if err.is_panic() => {
            tracing::error!("Handler task panicked: {err}");
            true
        }
        Err(_) => false,
    }
}

async fn run_worker<H: BuildHandler>(
    handler: &H,
    frame: Frame,
    token: CancellationToken,
    responses: &ResponseSender,
    errors: &AtomicU64,
) {
    let request_id = frame.request_id().cloned();
    let method = frame.method().unwrap_or_default().to_string();

    let result = handler.handle(frame, token.clone()).await;

    let Some(id) = request_id else {
        if let Err(err) = result {
            errors.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(method = %method, error = %err, "Notification handler failed");
        }
        return;
    };

    let response = match result {
        Ok(value) => Response::success(id, value.unwrap_or(serde_json::Value::Null)),
        Err(_) if token.is_cancelled() => {
            tracing::debug!(request_id = %id, method = %method, "Request cancelled");
            let cancelled = HandlerError::cancelled();
            Response::failure(id, cancelled.code(), cancelled.message())
        }
        Err(err) => {
            errors.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(request_id = %id, method = %method, error = %err, "Handler failed");
            Response::failure(id, err.code(), err.message())
        }
    };

    if !responses.send(response.into_value()).await {
        tracing::debug!(method = %method, "Transport closed before response was written");
    }
}
