//! Server-wide state shared by every connection's handler.

use tokio::sync::watch;

/// Cloneable handle to state that outlives individual connections.
///
/// Updates are applied in place and published to subscribers, so an
/// observer (a status line, a test) sees each change without polling.
#[derive(Debug)]
pub struct SharedState<S> {
    tx: watch::Sender<S>,
}

impl<S> Clone for SharedState<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Clone + Send + Sync + 'static> SharedState<S> {
    #[must_use]
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    /// Mutate the state and notify subscribers.
    pub fn update<F: FnOnce(&mut S)>(&self, f: F) {
        self.tx.send_modify(f);
    }

    #[must_use]
    pub fn snapshot(&self) -> S {
        self.tx.borrow().clone()
    }
}
