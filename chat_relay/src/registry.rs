// Bounded registry of live peer connections.
//
// `ConnectionRegistry` is the aggregate the dispatch loop in `server.rs`
// mutates: it admits new connections up to a fixed capacity, removes them on
// teardown, and hands out a stable iteration order for broadcast. All
// mutation happens on the loop thread, so there is no internal locking.
//
// Connections are keyed by a monotonically increasing `ConnectionId` in a
// `BTreeMap`. Ids are never reused for the lifetime of a registry, so a stale
// readiness event for a departed peer can never resolve to a newer one.
//
// The registry is generic over the stream type. The server stores
// `mio::net::TcpStream`; the unit tests below and in `broadcast.rs` store
// in-memory writers.
//
// The `watched` flag on each `Connection` records whether the stream is
// currently registered with the multiplexer. The registry never touches the
// multiplexer itself; `server.rs` keeps the two in step (watch after
// register, unwatch before unregister).

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use crate::error::RegistryError;

/// Registry-assigned connection id. Unique for the lifetime of the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One accepted peer stream.
#[derive(Debug)]
pub struct Connection<S> {
    pub id: ConnectionId,
    pub stream: S,
    pub peer_addr: Option<SocketAddr>,
    /// True while the stream is registered with the multiplexer.
    pub watched: bool,
    /// Bytes a non-blocking write could not deliver yet, oldest first.
    pub outbox: Vec<u8>,
}

impl<S> Connection<S> {
    /// Returns true if output is waiting for the socket to become writable.
    pub fn has_pending_output(&self) -> bool {
        !self.outbox.is_empty()
    }
}

/// A connection refused at admission. Carries the stream back so the caller
/// can close it.
#[derive(Debug)]
pub struct Rejected<S> {
    pub reason: RegistryError,
    pub stream: S,
}

pub struct ConnectionRegistry<S> {
    connections: BTreeMap<ConnectionId, Connection<S>>,
    capacity: usize,
    next_id: usize,
}

impl<S> ConnectionRegistry<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            capacity,
            next_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.capacity
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<S>> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    /// Admit a stream. Fails with `CapacityExceeded` when the registry is
    /// full, returning the stream untouched inside `Rejected`. A successful
    /// registration starts unwatched.
    pub fn register(
        &mut self,
        stream: S,
        peer_addr: Option<SocketAddr>,
    ) -> Result<ConnectionId, Rejected<S>> {
        if self.is_full() {
            return Err(Rejected {
                reason: RegistryError::CapacityExceeded {
                    capacity: self.capacity,
                },
                stream,
            });
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                stream,
                peer_addr,
                watched: false,
                outbox: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Remove a connection. Returns `None` if it was already gone; removing
    /// twice is not an error.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Connection<S>> {
        self.connections.remove(&id)
    }

    /// Ids of all registered connections, in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Snapshot of every id except `sender`, taken now.
    pub fn ids_except(&self, sender: ConnectionId) -> Vec<ConnectionId> {
        self.connections
            .keys()
            .copied()
            .filter(|id| *id != sender)
            .collect()
    }

    /// Call `f` once for each connection other than `sender`.
    ///
    /// The set of targets is snapshotted before the first call. A target that
    /// disappears before its turn is skipped; none is visited twice.
    pub fn for_each_except<F>(&mut self, sender: ConnectionId, mut f: F)
    where
        F: FnMut(&mut Connection<S>),
    {
        for id in self.ids_except(sender) {
            if let Some(conn) = self.connections.get_mut(&id) {
                f(conn);
            }
        }
    }
}
