//! Set of cancellation handles for frames currently being handled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_types::RequestId;
use tokio_util::sync::CancellationToken;

struct Entry {
    token: CancellationToken,
    request: Option<RequestId>,
}

/// Concurrently mutated set of in-flight handler tasks.
///
/// Only three things can happen to it: a task is inserted (returning a guard
/// that removes it on drop), one request is cancelled by id, or everything is
/// cancelled at once. Cancellation works on a snapshot taken under the lock,
/// so inserts racing with `cancel_all` are either cancelled or inserted after
/// it; in the latter case teardown has already closed the dispatcher.
#[derive(Default)]
pub struct InFlightTasks {
    next_key: AtomicU64,
    tasks: Mutex<HashMap<u64, Entry>>,
}

impl InFlightTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `token` before the task it guards starts.
    ///
    /// The entry is removed when the returned guard drops, whether the task
    /// finished, failed, was cancelled, or panicked.
    #[must_use = "dropping the guard deregisters the task immediately"]
    pub fn insert(
        self: &Arc<Self>,
        token: CancellationToken,
        request: Option<RequestId>,
    ) -> InFlightGuard {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(key, Entry { token, request });
        InFlightGuard {
            tasks: Arc::clone(self),
            key,
        }
    }

    /// Cancel every registered task. Does not wait for them to stop.
    /// Returns how many handles were signalled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancellationToken> =
            self.lock().values().map(|e| e.token.clone()).collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Cancel the task handling request `id`. `false` if no such task is
    /// running or it was already cancelled.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        let token = self
            .lock()
            .values()
            .find(|e| e.request.as_ref() == Some(id) && !e.token.is_cancelled())
            .map(|e| e.token.clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes its task from [`InFlightTasks`] when dropped.
pub struct InFlightGuard {
    tasks: Arc<InFlightTasks>,
    key: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tasks.lock().remove(&self.key);
    }
}
