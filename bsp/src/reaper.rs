//! Deferred sweep of client artifact directories nobody owns any more.
//!
//! A connection schedules one [`ReaperJob`] when it tears down. The job runs
//! on its own task after a short delay, so a client that reconnects right
//! away has time to register again before the sweep looks at who is live.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_types::ClientId;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::registry::ClientRegistry;

pub const DEFAULT_REAPER_DELAY: Duration = Duration::from_millis(100);

/// Snapshot of live clients taken when one connection ended.
#[derive(Debug, Clone)]
pub struct ReaperJob {
    live: HashSet<ClientId>,
    disconnected: Option<ClientId>,
}

impl ReaperJob {
    /// `disconnected` is merged into the live set here and only dropped from
    /// it at sweep time, once the sweep can see it has not re-registered.
    #[must_use]
    pub fn new(mut live: HashSet<ClientId>, disconnected: Option<ClientId>) -> Self {
        if let Some(client) = &disconnected {
            live.insert(client.clone());
        }
        Self { live, disconnected }
    }

    #[must_use]
    pub fn disconnected(&self) -> Option<&ClientId> {
        self.disconnected.as_ref()
    }

    #[must_use]
    pub fn live(&self) -> &HashSet<ClientId> {
        &self.live
    }

    /// Identities whose directories must survive, given the registry as it is
    /// now.
    fn retained(&self, current: HashSet<ClientId>) -> HashSet<ClientId> {
        let mut retained = current;
        let reconnected = self
            .disconnected
            .as_ref()
            .is_some_and(|client| retained.contains(client));
        retained.extend(self.live.iter().cloned());
        if let Some(client) = &self.disconnected
            && !reconnected
        {
            retained.remove(client);
        }
        retained
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// Directories removed by this sweep.
    pub deleted: Vec<ClientId>,
    /// Directories that vanished before the sweep got to them.
    pub missing: Vec<ClientId>,
    /// Directories that could not be removed, with the error.
    pub failed: Vec<(ClientId, String)>,
    /// Client directories left alone because their owner is live.
    pub retained: usize,
}

/// Schedules and runs [`ReaperJob`]s against one clients directory.
#[derive(Debug, Clone)]
pub struct Reaper {
    registry: Arc<ClientRegistry>,
    clients_dir: PathBuf,
    delay: Duration,
}

impl Reaper {
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry>, clients_dir: PathBuf, delay: Duration) -> Self {
        Self {
            registry,
            clients_dir,
            delay,
        }
    }

    #[must_use]
    pub fn clients_dir(&self) -> &Path {
        &self.clients_dir
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `job` after the configured delay on a detached task.
    ///
    /// The task does not observe any connection's cancellation; it outlives
    /// the connection that scheduled it. Returns `None` only when called
    /// outside a Tokio runtime.
    pub fn schedule(&self, job: ReaperJob) -> Option<JoinHandle<ReapReport>> {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("No runtime available; skipping client directory sweep");
            return None;
        };
        let reaper = self.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(reaper.delay).await;
            reaper.sweep(job).await
        }))
    }

    /// Delete every client directory not owned by a live client.
    ///
    /// Best effort per directory: one failure never stops the others, and
    /// nothing is escalated.
    pub async fn sweep(&self, job: ReaperJob) -> ReapReport {
        let retained = job.retained(self.registry.snapshot());
        let mut report = ReapReport::default();

        let candidates = match self.client_directories().await {
            Ok(candidates) => candidates,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
            Err(e) => {
                tracing::warn!(
                    dir = %self.clients_dir.display(),
                    "Cannot list client directories: {e}"
                );
                return report;
            }
        };

        for (client, path) in candidates {
            if retained.contains(&client) {
                report.retained += 1;
                continue;
            }
            let registry = Arc::clone(&self.registry);
            let target = path.clone();
            let removed = tokio::task::spawn_blocking(move || {
                registry.remove_unowned(&target, |dir| std::fs::remove_dir_all(dir))
            })
            .await;
            match removed {
                Ok(None) => {
                    tracing::debug!(client = %client, "Client registered again before removal");
                    report.retained += 1;
                }
                Ok(Some(Ok(()))) => {
                    tracing::info!(client = %client, "Removed orphaned client directory");
                    report.deleted.push(client);
                }
                Ok(Some(Err(e))) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(client = %client, "Client directory already gone");
                    report.missing.push(client);
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(
                        client = %client,
                        path = %path.display(),
                        "Failed to remove client directory: {e}"
                    );
                    report.failed.push((client, e.to_string()));
                }
                Err(e) => {
                    tracing::warn!(client = %client, "Directory removal task failed: {e}");
                    report.failed.push((client, e.to_string()));
                }
            }
        }

        report
    }

    /// Subdirectories of the clients directory whose names are valid client
    /// identities. Files, symlinks, and foreign names are never candidates.
    async fn client_directories(&self) -> io::Result<Vec<(ClientId, PathBuf)>> {
        let mut entries = tokio::fs::read_dir(&self.clients_dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let Some(client) = entry
                .file_name()
                .to_str()
                .and_then(|name| ClientId::new(name).ok())
            else {
                continue;
            };
            found.push((client, entry.path()));
        }

        found.sort();
        Ok(found)
    }
}
