use std::sync::Arc;
use parking_lot::Mutex;
use crate::connection::Connection;

#[derive(Default)]
struct Inner {
    last_id: u32,
    connections: Vec<Arc<Connection>>,
}

/// Live connections in acceptance order. One lock covers insertion,
/// removal and id assignment; callers do their I/O on snapshots.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next id, build the connection with it and track it.
    /// Ids wrap after `u32::MAX` connections.
    pub fn register(&self, build: impl FnOnce(u32) -> Connection) -> Arc<Connection> {
        let mut inner = self.inner.lock();
        inner.last_id = inner.last_id.wrapping_add(1);
        let conn = Arc::new(build(inner.last_id));
        inner.connections.push(Arc::clone(&conn));
        conn
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.clone()
    }

    pub fn get(&self, id: u32) -> Option<Arc<Connection>> {
        self.inner.lock().connections.iter().find(|c| c.id() == id).cloned()
    }

    /// Drop the connections with the given ids. Returns how many.
    pub fn remove_ids(&self, ids: &[u32]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let before = inner.connections.len();
        inner.connections.retain(|c| !ids.contains(&c.id()));
        before - inner.connections.len()
    }

    /// Take every connection out of the registry.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut self.inner.lock().connections)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
