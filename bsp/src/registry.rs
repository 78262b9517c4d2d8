//! Process-wide table of connected clients and their artifact directories.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use kiln_types::ClientId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("directory {} already belongs to client {owner}", path.display())]
    DirectoryInUse { path: PathBuf, owner: ClientId },
    #[error("client {client} is already registered with {}", existing.display())]
    ClientRebound { client: ClientId, existing: PathBuf },
    #[error("client {0} is already connected")]
    ClientInUse(ClientId),
}

/// Maps each connected client to its private artifact directory.
///
/// Shared by every connection of one server through an `Arc`. The registry
/// only records ownership; it never touches the filesystem.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, PathBuf>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, PathBuf>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `client` as owning `directory`.
    ///
    /// Registering the same pair twice is a no-op. A directory owned by a
    /// different client, or a client already bound to another directory, is
    /// rejected.
    pub fn register(&self, client: ClientId, directory: PathBuf) -> Result<(), RegistryError> {
        let mut clients = self.lock();

        if let Some(existing) = clients.get(&client) {
            if *existing == directory {
                return Ok(());
            }
            return Err(RegistryError::ClientRebound {
                client,
                existing: existing.clone(),
            });
        }

        insert_unowned(&mut clients, client, directory)
    }

    /// Record `client` as owning `directory` for a new connection.
    ///
    /// Unlike [`register`](Self::register), an identity that is already
    /// present is rejected even for the same directory: each entry belongs to
    /// exactly one live connection.
    pub fn claim(&self, client: ClientId, directory: PathBuf) -> Result<(), RegistryError> {
        let mut clients = self.lock();
        if clients.contains_key(&client) {
            return Err(RegistryError::ClientInUse(client));
        }
        insert_unowned(&mut clients, client, directory)
    }

    /// Remove `client` and return the directory it owned.
    pub fn unregister(&self, client: &ClientId) -> Option<PathBuf> {
        let removed = self.lock().remove(client);
        if removed.is_some() {
            tracing::debug!(client = %client, "Client unregistered");
        }
        removed
    }

    /// Point-in-time copy of the registered identities.
    #[must_use]
    pub fn snapshot(&self) -> HashSet<ClientId> {
        self.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn directory_of(&self, client: &ClientId) -> Option<PathBuf> {
        self.lock().get(client).cloned()
    }

    #[must_use]
    pub fn contains(&self, client: &ClientId) -> bool {
        self.lock().contains_key(client)
    }

    /// Whether any registered client owns `directory`.
    #[must_use]
    pub fn owns_directory(&self, directory: &Path) -> bool {
        self.lock().values().any(|dir| dir == directory)
    }

    /// Run `remove` on `directory` unless a registered client owns it.
    ///
    /// The registry stays locked while `remove` runs, so a client registering
    /// for `directory` waits until the removal is over. Returns `None` when
    /// the directory is owned.
    pub fn remove_unowned<T>(
        &self,
        directory: &Path,
        remove: impl FnOnce(&Path) -> T,
    ) -> Option<T> {
        let clients = self.lock();
        if clients.values().any(|dir| dir == directory) {
            return None;
        }
        Some(remove(directory))
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

fn insert_unowned(
    clients: &mut HashMap<ClientId, PathBuf>,
    client: ClientId,
    directory: PathBuf,
) -> Result<(), RegistryError> {
    if let Some((owner, _)) = clients.iter().find(|(_, dir)| **dir == directory) {
        return Err(RegistryError::DirectoryInUse {
            path: directory,
            owner: owner.clone(),
        });
    }

    tracing::debug!(client = %client, dir = %directory.display(), "Client registered");
    clients.insert(client, directory);
    Ok(())
}
