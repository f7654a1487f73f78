use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::metrics::metrics;
use crate::session::ConnectionId;

/// Something that can force a client socket closed from outside its task.
pub trait ConnectionHandle: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

impl ConnectionHandle for std::net::TcpStream {
    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            // The peer got there first.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

struct Entry {
    peer: SocketAddr,
    handle: Box<dyn ConnectionHandle>,
}

/// Live client connections by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, peer: SocketAddr, handle: Box<dyn ConnectionHandle>) {
        self.connections.lock().insert(id, Entry { peer, handle });
        debug!(conn_id = %id, peer = %peer, "Connection registered");
    }

    /// Returns false if the connection was already gone, e.g. after `close_all`.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(&id).is_some()
    }

    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.lock().get(&id).map(|e| e.peer)
    }

    /// Empty the registry, then close every handle. Every handle is tried;
    /// the failures are returned.
    pub fn close_all(&self) -> Vec<(ConnectionId, io::Error)> {
        let drained: Vec<_> = self.connections.lock().drain().collect();
        drained
            .into_iter()
            .filter_map(|(id, entry)| entry.handle.close().err().map(|e| (id, e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

/// Deregisters a connection when its worker finishes, however it finishes.
pub(crate) struct Registration {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    pub(crate) fn new(id: ConnectionId, registry: Arc<ConnectionRegistry>) -> Self {
        metrics().record_connection_accepted();
        Self { id, registry }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
        metrics().record_connection_closed();
    }
}
