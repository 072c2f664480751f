use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    connection::{Connection, ConnectionId},
    protocol::ClientRecord,
};

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Names must not be empty.
    #[error("name is empty")]
    EmptyName,
    /// Another live connection holds the name.
    #[error("name {0:?} is already taken")]
    NameTaken(String),
}

#[derive(Debug, Default)]
struct Inner {
    by_conn: BTreeMap<ConnectionId, (Arc<Connection>, ClientRecord)>,
    by_name: HashMap<String, ConnectionId>,
}

/// Directory of connected, named clients.
///
/// Both views live behind one lock and are always updated together; the lock
/// is never held across an `.await`.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation leaves both maps consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `conn` under `record`.
    pub fn register(
        &self,
        conn: Arc<Connection>,
        record: ClientRecord,
    ) -> Result<(), RegistryError> {
        if record.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut inner = self.lock();
        if inner.by_name.contains_key(&record.name) {
            return Err(RegistryError::NameTaken(record.name));
        }
        let id = conn.id();
        inner.by_name.insert(record.name.clone(), id);
        inner.by_conn.insert(id, (conn, record));
        Ok(())
    }

    /// Remove a connection from both views. Only the first call for a given
    /// connection returns its record.
    pub fn unregister(&self, id: ConnectionId) -> Option<ClientRecord> {
        let mut inner = self.lock();
        let (_conn, record) = inner.by_conn.remove(&id)?;
        inner.by_name.remove(&record.name);
        Some(record)
    }

    /// Find the live connection registered under `name`.
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        let inner = self.lock();
        let id = inner.by_name.get(name)?;
        inner.by_conn.get(id).map(|(conn, _)| Arc::clone(conn))
    }

    /// Point-in-time copy of all entries, in registration order.
    pub fn snapshot(&self) -> Vec<(Arc<Connection>, ClientRecord)> {
        self.lock()
            .by_conn
            .values()
            .map(|(conn, record)| (Arc::clone(conn), record.clone()))
            .collect()
    }

    /// Names of all registered clients, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.lock().by_conn.len()
    }

    /// Whether nobody is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
