// Readiness multiplexer over `mio::Poll`.
//
// Wraps the OS event-notification primitive (epoll on Linux, kqueue on the
// BSDs and macOS) behind the three operations the dispatch loop needs:
// `watch`, `unwatch` and `wait`. `wait` reports exactly the handles that are
// ready, so there is no descriptor-range scan and no maximum-descriptor
// bookkeeping.
//
// Token layout:
// - `Token(0)`: the listening socket.
// - `Token(1)`: the shutdown waker (see `server::ShutdownHandle`).
// - `Token(2 + n)`: connection `ConnectionId(n)`.
//
// `mio` readiness is edge-triggered. Callers must drain every ready socket
// until it reports `WouldBlock`, or they will not be woken for it again.
//
// The multiplexer keeps its own record of which connections are watched and
// with what interest, so the server can assert that the registry and the
// watched set agree.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::event::Source as EventSource;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::RelayError;
use crate::registry::ConnectionId;

const LISTENER_TOKEN: Token = Token(0);
const SHUTDOWN_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_BASE: usize = 2;

/// What a ready token refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Listener,
    Shutdown,
    Connection(ConnectionId),
}

/// One entry of a ready batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub source: Source,
    pub readable: bool,
    pub writable: bool,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    watched: HashMap<ConnectionId, Interest>,
    listener_watched: bool,
}

impl Multiplexer {
    /// Create a multiplexer that reports up to `events_capacity` ready
    /// handles per wait. More ready handles are reported on the next wait.
    pub fn new(events_capacity: usize) -> Result<Self, RelayError> {
        let poll = Poll::new().map_err(RelayError::Setup)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity.max(1)),
            watched: HashMap::new(),
            listener_watched: false,
        })
    }

    /// Create the waker that interrupts `wait` for shutdown. Only one waker
    /// may exist per multiplexer.
    pub fn shutdown_waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), SHUTDOWN_TOKEN)
    }

    pub fn watch_listener(&mut self, listener: &mut TcpListener) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener_watched = true;
        Ok(())
    }

    pub fn unwatch_listener(&mut self, listener: &mut TcpListener) -> io::Result<()> {
        self.listener_watched = false;
        self.poll.registry().deregister(listener)
    }

    pub fn is_listener_watched(&self) -> bool {
        self.listener_watched
    }

    /// Start watching a connection for readability.
    pub fn watch<S>(&mut self, stream: &mut S, id: ConnectionId) -> io::Result<()>
    where
        S: EventSource + ?Sized,
    {
        self.poll
            .registry()
            .register(stream, token_for(id), Interest::READABLE)?;
        self.watched.insert(id, Interest::READABLE);
        Ok(())
    }

    /// Add or drop writable interest for a watched connection. No-op if the
    /// interest is already as requested.
    pub fn set_write_interest<S>(
        &mut self,
        stream: &mut S,
        id: ConnectionId,
        writable: bool,
    ) -> io::Result<()>
    where
        S: EventSource + ?Sized,
    {
        let wanted = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self.watched.get(&id) {
            Some(current) if *current == wanted => Ok(()),
            Some(_) => {
                self.poll
                    .registry()
                    .reregister(stream, token_for(id), wanted)?;
                self.watched.insert(id, wanted);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("connection {id} is not watched"),
            )),
        }
    }

    /// Stop watching a connection. The connection is forgotten even if the
    /// OS deregistration fails, since the caller is about to close it.
    pub fn unwatch<S>(&mut self, stream: &mut S, id: ConnectionId) -> io::Result<()>
    where
        S: EventSource + ?Sized,
    {
        self.watched.remove(&id);
        self.poll.registry().deregister(stream)
    }

    pub fn is_watched(&self, id: ConnectionId) -> bool {
        self.watched.contains_key(&id)
    }

    pub fn wants_writable(&self, id: ConnectionId) -> bool {
        self.watched
            .get(&id)
            .is_some_and(|interest| interest.is_writable())
    }

    /// Number of watched connections (the listener and waker not included).
    pub fn watched_len(&self) -> usize {
        self.watched.len()
    }

    /// Block until at least one watched handle is ready, or until `timeout`
    /// elapses (`None` waits indefinitely). Interrupted waits are retried.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Readiness>, RelayError> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::Wait(e)),
            }
        }

        Ok(self
            .events
            .iter()
            .map(|event| Readiness {
                source: source_for(event.token()),
                // Errors and hang-ups surface through the next read.
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            })
            .collect())
    }
}

fn token_for(id: ConnectionId) -> Token {
    Token(CONNECTION_TOKEN_BASE + id.0)
}

fn source_for(token: Token) -> Source {
    match token {
        LISTENER_TOKEN => Source::Listener,
        SHUTDOWN_TOKEN => Source::Shutdown,
        Token(n) => Source::Connection(ConnectionId(n - CONNECTION_TOKEN_BASE)),
    }
}
