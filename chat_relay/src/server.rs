// Relay server context and the event dispatch loop.
//
// Architecture: one thread, one readiness wait.
//
// - `RelayServer` owns everything: the listening socket, the
//   `ConnectionRegistry` of peer streams, the `Multiplexer`, a reusable read
//   buffer, and the shared `RelayStats`. No process-wide state.
// - `run` loops on `poll_once`: block in `Multiplexer::wait`, then dispatch
//   the whole ready batch before waiting again.
//   - Listener ready: accept until the queue is drained. Each new stream is
//     registered first (capacity check) and watched second; a refused stream
//     is closed without ever being watched.
//   - Peer readable: read until `WouldBlock` or until the per-turn read
//     budget is spent. Each chunk is relayed to every other peer.
//     End-of-stream or a read error tears the peer down.
//   - Peer writable: flush its outbox; drop writable interest once empty.
// - A peer that spends its read budget still has unread input, and the
//   edge-triggered wait will not report it again. Its id goes into
//   `still_readable`; the next turn waits with a zero timeout and reads from
//   it again. A peer that never stops sending cannot keep the loop away from
//   the listener, the other peers or the shutdown flag.
// - Teardown order is unwatch, close, unregister, so a stale descriptor can
//   never wake the loop without a registry entry to resolve it. Ids are never
//   reused, and events for ids already gone are skipped.
// - Broadcast write failures follow `WriteFailurePolicy` (see `broadcast.rs`).
//
// Shutdown: `ShutdownHandle::trigger` clears the `keep_running` flag and wakes
// the wait through a `mio::Waker`. The loop then closes the listener, relays
// anything peers already sent, flushes pending output best-effort, and closes
// every peer.
//
// `start_relay` runs the loop on a background thread and returns a
// `RelayHandle` for stopping it. The `relay` binary instead calls
// `RelayServer::bind` and `run` on the main thread.

use std::collections::BTreeSet;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Waker;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::{self, WriteFailurePolicy};
use crate::error::{DeliveryError, RelayError};
use crate::listener::{self, DEFAULT_BACKLOG};
use crate::multiplexer::{Multiplexer, Readiness, Source};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stats::{RelayStats, StatsSnapshot};

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub backlog: i32,
    /// Maximum number of simultaneously registered peers.
    pub max_connections: usize,
    /// Size of the buffer for one socket read, and so the largest chunk
    /// relayed at once.
    pub read_buffer_size: usize,
    /// Per-peer limit on output queued while its socket is not writable.
    pub max_pending_bytes: usize,
    /// Ready handles reported per wait.
    pub events_capacity: usize,
    /// Socket reads from one peer per loop turn before the others get a go.
    pub max_reads_per_turn: usize,
    pub write_failure_policy: WriteFailurePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            backlog: DEFAULT_BACKLOG,
            max_connections: 30,
            read_buffer_size: 1024,
            max_pending_bytes: 1024 * 1024,
            events_capacity: 128,
            max_reads_per_turn: 16,
            write_failure_policy: WriteFailurePolicy::Eager,
        }
    }
}

impl RelayConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Why a peer left. Logged on teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Departure {
    Closed,
    ReadFailed,
    WriteFailed,
    Shutdown,
}

/// Cloneable, thread-safe trigger for graceful shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    keep_running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to stop. Returns immediately; the loop finishes its
    /// current batch and then shuts down.
    pub fn trigger(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake relay loop for shutdown");
        }
    }

    pub fn is_triggered(&self) -> bool {
        !self.keep_running.load(Ordering::SeqCst)
    }
}

pub struct RelayServer {
    config: RelayConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    registry: ConnectionRegistry<TcpStream>,
    mux: Multiplexer,
    read_buf: Vec<u8>,
    /// Peers whose last read stopped at the budget, not at `WouldBlock`.
    still_readable: BTreeSet<ConnectionId>,
    shutdown: ShutdownHandle,
    stats: Arc<RelayStats>,
}

impl RelayServer {
    /// Bind the listening socket and set up the event loop. Fails with
    /// `Bind`/`Listen` for socket problems and `Setup` if the OS event queue
    /// cannot be created.
    pub fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let mut listener = listener::start(config.socket_addr(), config.backlog)?;
        let local_addr = listener.local_addr().map_err(RelayError::Setup)?;

        let mut mux = Multiplexer::new(config.events_capacity)?;
        mux.watch_listener(&mut listener)
            .map_err(RelayError::Setup)?;
        let waker = mux.shutdown_waker().map_err(RelayError::Setup)?;

        info!(
            %local_addr,
            max_connections = config.max_connections,
            backlog = config.backlog,
            write_failures = ?config.write_failure_policy,
            "relay listening"
        );

        Ok(Self {
            registry: ConnectionRegistry::new(config.max_connections),
            read_buf: vec![0; config.read_buffer_size.max(1)],
            still_readable: BTreeSet::new(),
            listener: Some(listener),
            local_addr,
            mux,
            shutdown: ShutdownHandle {
                keep_running: Arc::new(AtomicBool::new(true)),
                waker: Arc::new(waker),
            },
            stats: Arc::new(RelayStats::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    /// Run until shutdown is triggered. Returns `Err` only if the readiness
    /// wait itself fails; peers are closed either way.
    pub fn run(&mut self) -> Result<(), RelayError> {
        let result = self.serve();
        if let Err(e) = &result {
            error!(error = %e, "relay loop failed");
        }
        self.close();

        let stats = self.stats.snapshot();
        match serde_json::to_string(&stats) {
            Ok(json) => info!(stats = %json, "relay stopped"),
            Err(e) => info!(?stats, error = %e, "relay stopped"),
        }
        result
    }

    fn serve(&mut self) -> Result<(), RelayError> {
        while !self.shutdown.is_triggered() {
            self.poll_once(None)?;
        }
        Ok(())
    }

    /// Wait for one ready batch (up to `timeout`) and dispatch all of it,
    /// then give each peer left over from the previous turn another read
    /// budget. Returns the number of handles served.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize, RelayError> {
        let carried: Vec<ConnectionId> = self.still_readable.iter().copied().collect();
        let timeout = if carried.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let ready = self.mux.wait(timeout)?;
        for readiness in &ready {
            self.dispatch(readiness);
        }

        let mut served = ready.len();
        for id in carried {
            let read_in_batch = ready
                .iter()
                .any(|r| r.source == Source::Connection(id) && r.readable);
            if !read_in_batch && self.still_readable.contains(&id) {
                self.read_from(id);
                served += 1;
            }
        }
        Ok(served)
    }

    fn dispatch(&mut self, readiness: &Readiness) {
        match readiness.source {
            Source::Listener => self.accept_pending(),
            // `serve` checks the flag after the batch.
            Source::Shutdown => {}
            Source::Connection(id) => {
                if !self.registry.contains(id) {
                    trace!(%id, "event for departed connection");
                    return;
                }
                if readiness.writable {
                    self.flush_to(id);
                }
                if readiness.readable && self.registry.contains(id) {
                    self.read_from(id);
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        // Accept everything first, then admit, so the listener borrow ends
        // before the registry is touched.
        let mut accepted = Vec::new();
        loop {
            match listener::accept(listener) {
                Ok(Some(pair)) => accepted.push(pair),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed; continuing");
                    break;
                }
            }
        }

        for (stream, peer_addr) in accepted {
            self.admit(stream, peer_addr);
        }
    }

    /// Register a new stream, then watch it. Capacity is checked before the
    /// stream is ever watched.
    fn admit(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = match self.registry.register(stream, Some(peer_addr)) {
            Ok(id) => id,
            Err(rejected) => {
                warn!(%peer_addr, reason = %rejected.reason, "connection refused");
                if let Err(e) = rejected.stream.shutdown(Shutdown::Both) {
                    trace!(%peer_addr, error = %e, "shutdown of refused stream failed");
                }
                self.stats.connection_refused();
                return;
            }
        };

        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if let Err(source) = self.mux.watch(&mut conn.stream, id) {
            let e = RelayError::Watch { id, source };
            error!(%peer_addr, error = %e, "dropping connection");
            self.registry.unregister(id);
            return;
        }
        conn.watched = true;

        self.stats.connection_opened();
        info!(
            %id,
            %peer_addr,
            connected = self.registry.len(),
            capacity = self.registry.capacity(),
            "peer connected"
        );
    }

    /// Read from a peer until `WouldBlock` or the turn's read budget runs
    /// out, relaying each chunk as it is read.
    fn read_from(&mut self, id: ConnectionId) {
        self.still_readable.remove(&id);
        for _ in 0..self.config.max_reads_per_turn.max(1) {
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };
            let len = match conn.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    self.teardown(id, Departure::Closed);
                    return;
                }
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(%id, error = %e, "read failed");
                    self.teardown(id, Departure::ReadFailed);
                    return;
                }
            };
            self.stats.bytes_received(len);
            self.relay_from(id, len);
        }

        if self.registry.contains(id) {
            trace!(%id, "read budget spent");
            self.still_readable.insert(id);
        }
    }

    fn relay_from(&mut self, sender: ConnectionId, len: usize) {
        let report = broadcast::relay(
            &mut self.registry,
            sender,
            &self.read_buf[..len],
            self.config.max_pending_bytes,
        );
        debug!(
            %sender,
            bytes = len,
            targets = report.targets(),
            delivered = report.delivered,
            failed = report.failed.len(),
            "relayed"
        );
        self.stats.delivered(report.delivered);

        for id in report.backlogged {
            self.update_write_interest(id);
        }
        for (id, err) in report.failed {
            self.delivery_failed(id, err);
        }
    }

    fn flush_to(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        match broadcast::flush(conn) {
            Ok(true) => self.update_write_interest(id),
            Ok(false) => {}
            Err(err) => self.delivery_failed(id, err),
        }
    }

    fn delivery_failed(&mut self, id: ConnectionId, err: DeliveryError) {
        self.stats.delivery_failed(1);
        match self.config.write_failure_policy {
            WriteFailurePolicy::Eager => {
                warn!(%id, error = %err, "delivery failed; dropping peer");
                self.teardown(id, Departure::WriteFailed);
            }
            WriteFailurePolicy::Lazy => {
                // Deliberately unlogged above trace: the peer's next read
                // reports the dead socket.
                trace!(%id, error = %err, "delivery failed; payload dropped");
                if !matches!(err, DeliveryError::Backlogged { .. }) {
                    if let Some(conn) = self.registry.get_mut(id) {
                        conn.outbox.clear();
                    }
                    self.update_write_interest(id);
                }
            }
        }
    }

    /// Match the peer's writable interest to whether it has queued output.
    fn update_write_interest(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !conn.watched {
            return;
        }
        let wants = conn.has_pending_output();
        if self.mux.wants_writable(id) == wants {
            return;
        }
        if let Err(e) = self.mux.set_write_interest(&mut conn.stream, id, wants) {
            warn!(%id, error = %e, "failed to update write interest");
            self.teardown(id, Departure::WriteFailed);
        }
    }

    /// Unwatch, close and unregister one peer. No-op if it is already gone.
    fn teardown(&mut self, id: ConnectionId, departure: Departure) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        if conn.watched {
            if let Err(e) = self.mux.unwatch(&mut conn.stream, id) {
                debug!(%id, error = %e, "deregister failed");
            }
            conn.watched = false;
        }
        if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
            trace!(%id, error = %e, "shutdown failed");
        }
        let peer_addr = conn.peer_addr;

        // Dropping the stream closes the descriptor.
        self.registry.unregister(id);
        self.still_readable.remove(&id);
        self.stats.connection_closed();
        info!(
            %id,
            peer_addr = ?peer_addr,
            cause = ?departure,
            connected = self.registry.len(),
            "peer disconnected"
        );
    }

    /// Stop accepting, relay what peers already sent, then close everyone.
    fn close(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.mux.unwatch_listener(&mut listener) {
                debug!(error = %e, "deregister listener failed");
            }
            info!(local_addr = %self.local_addr, "listener closed");
        }

        match self.mux.wait(Some(Duration::ZERO)) {
            Ok(ready) => {
                for readiness in ready
                    .iter()
                    .filter(|r| matches!(r.source, Source::Connection(_)))
                {
                    self.dispatch(readiness);
                }
            }
            Err(e) => warn!(error = %e, "final readiness pass failed"),
        }

        for id in self.registry.ids() {
            if let Some(conn) = self.registry.get_mut(id) {
                if conn.has_pending_output() {
                    if let Err(e) = broadcast::flush(conn) {
                        debug!(%id, error = %e, "final flush failed");
                    }
                }
            }
            self.teardown(id, Departure::Shutdown);
        }
    }
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    shutdown: ShutdownHandle,
    stats: Arc<RelayStats>,
    thread: Option<JoinHandle<Result<(), RelayError>>>,
}

impl RelayHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(mut self) -> Result<(), RelayError> {
        self.shutdown.trigger();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| RelayError::ThreadPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.trigger();
            let _ = thread.join();
        }
    }
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let mut server = RelayServer::bind(config)?;
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let stats = server.stats();

    let thread = thread::Builder::new()
        .name("chat-relay".into())
        .spawn(move || server.run())
        .map_err(RelayError::Setup)?;

    Ok((
        RelayHandle {
            shutdown,
            stats,
            thread: Some(thread),
        },
        addr,
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::time::Instant;

    use super::*;

    fn test_config(max_connections: usize) -> RelayConfig {
        RelayConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            max_connections,
            ..RelayConfig::default()
        }
    }

    /// Drive the loop from the test thread until `done` holds.
    fn pump_until(server: &mut RelayServer, done: impl Fn(&RelayServer) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(server) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            server.poll_once(Some(Duration::from_millis(10))).unwrap();
        }
    }

    /// Drive the loop for a fixed stretch, for asserting that nothing happens.
    fn pump_for(server: &mut RelayServer, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            server.poll_once(Some(Duration::from_millis(10))).unwrap();
        }
    }

    fn connect(server: &RelayServer) -> StdTcpStream {
        let stream = StdTcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Connect a client and pump until the server has registered it.
    fn join(server: &mut RelayServer) -> StdTcpStream {
        let before = server.stats.snapshot().accepted;
        let stream = connect(server);
        pump_until(server, |s| s.stats.snapshot().accepted > before);
        stream
    }

    fn read_exactly(stream: &mut StdTcpStream, len: usize, server: &mut RelayServer) -> Vec<u8> {
        // The server is driven from this thread, so pump between reads.
        stream
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while out.len() < len {
            assert!(Instant::now() < deadline, "timed out reading {len} bytes");
            server.poll_once(Some(Duration::from_millis(10))).unwrap();
            match stream.read(&mut buf) {
                Ok(0) => panic!("unexpected EOF after {} bytes", out.len()),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    }

    fn assert_nothing_to_read(stream: &mut StdTcpStream) {
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(n) => panic!("expected silence, read {n} bytes"),
            Err(e) => assert!(matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            )),
        }
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 30);
        assert_eq!(config.backlog, 5);
        assert_eq!(config.write_failure_policy, WriteFailurePolicy::Eager);
        assert_eq!(config.max_reads_per_turn, 16);
        assert!(config.bind_address.is_unspecified());
    }

    #[test]
    fn refused_connection_is_closed_and_never_watched() {
        let mut server = RelayServer::bind(test_config(2)).unwrap();
        let _c1 = join(&mut server);
        let _c2 = join(&mut server);

        let mut c3 = connect(&server);
        pump_until(&mut server, |s| s.stats.snapshot().refused == 1);

        assert_eq!(server.connection_count(), 2);
        assert_eq!(server.mux.watched_len(), 2);

        // Refused peer observes an orderly close with no data.
        let mut buf = [0u8; 16];
        match c3.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[test]
    fn relays_to_others_without_echo() {
        let mut server = RelayServer::bind(test_config(4)).unwrap();
        let mut c1 = join(&mut server);
        let mut c2 = join(&mut server);

        c1.write_all(b"hello\n").unwrap();
        let got = read_exactly(&mut c2, 6, &mut server);
        assert_eq!(got, b"hello\n");

        pump_for(&mut server, Duration::from_millis(30));
        assert_nothing_to_read(&mut c1);
    }

    #[test]
    fn sole_peer_send_writes_nothing() {
        let mut server = RelayServer::bind(test_config(4)).unwrap();
        let mut c1 = join(&mut server);

        c1.write_all(b"anyone?\n").unwrap();
        pump_until(&mut server, |s| s.stats.snapshot().bytes_received == 8);

        let stats = server.stats.snapshot();
        assert_eq!(stats.deliveries, 0);
        assert_eq!(stats.delivery_failures, 0);
        assert_eq!(server.connection_count(), 1);
        assert_nothing_to_read(&mut c1);
    }

    #[test]
    fn disconnect_unwatches_and_frees_slot() {
        let mut server = RelayServer::bind(test_config(2)).unwrap();
        let c1 = join(&mut server);
        let mut c2 = join(&mut server);
        let departed = server.connection_ids()[0];
        assert!(server.mux.is_watched(departed));

        drop(c1);
        pump_until(&mut server, |s| s.connection_count() == 1);
        assert!(!server.mux.is_watched(departed));
        assert!(!server.registry.contains(departed));

        c2.write_all(b"still here\n").unwrap();
        pump_until(&mut server, |s| s.stats.snapshot().bytes_received == 11);

        // The freed slot admits a newcomer.
        let mut c3 = join(&mut server);
        assert_eq!(server.connection_count(), 2);
        assert_eq!(server.stats.snapshot().refused, 0);

        c2.write_all(b"welcome\n").unwrap();
        assert_eq!(read_exactly(&mut c3, 8, &mut server), b"welcome\n");
    }

    #[test]
    fn peer_past_its_read_budget_is_served_on_later_turns() {
        let mut server = RelayServer::bind(RelayConfig {
            read_buffer_size: 4,
            max_reads_per_turn: 1,
            ..test_config(2)
        })
        .unwrap();
        let mut c1 = join(&mut server);
        let mut c2 = join(&mut server);

        // One write, one readiness edge; the rest must come from carry-over.
        c1.write_all(b"abcdefghijkl").unwrap();
        assert_eq!(read_exactly(&mut c2, 12, &mut server), b"abcdefghijkl");
        pump_for(&mut server, Duration::from_millis(30));
        assert!(server.still_readable.is_empty());
    }

    #[test]
    fn flooding_peer_does_not_starve_admission() {
        let mut server = RelayServer::bind(test_config(4)).unwrap();
        let mut flooder = join(&mut server);

        let writer = thread::spawn(move || {
            let chunk = vec![b'x'; 64 * 1024];
            // Ends when the relay closes the socket.
            while flooder.write_all(&chunk).is_ok() {}
        });
        pump_until(&mut server, |s| {
            s.stats.snapshot().bytes_received > 1024 * 1024
        });

        let started = Instant::now();
        let _late = connect(&server);
        pump_until(&mut server, |s| s.stats.snapshot().accepted == 2);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "admission took {:?}",
            started.elapsed()
        );

        server.shutdown_handle().trigger();
        server.run().unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn teardown_twice_is_noop() {
        let mut server = RelayServer::bind(test_config(2)).unwrap();
        let _c1 = join(&mut server);
        let id = server.connection_ids()[0];

        server.teardown(id, Departure::Closed);
        server.teardown(id, Departure::Closed);

        let stats = server.stats.snapshot();
        assert_eq!(stats.connected, 0);
        assert_eq!(stats.disconnected, 1);
        assert_eq!(server.mux.watched_len(), 0);
    }

    #[test]
    fn events_for_departed_ids_are_ignored() {
        let mut server = RelayServer::bind(test_config(2)).unwrap();
        server.dispatch(&Readiness {
            source: Source::Connection(ConnectionId(17)),
            readable: true,
            writable: true,
        });
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn registry_and_watched_set_stay_in_step() {
        let mut server = RelayServer::bind(test_config(3)).unwrap();
        let mut clients: Vec<_> = (0..3).map(|_| join(&mut server)).collect();
        let _refused = connect(&server);
        pump_until(&mut server, |s| s.stats.snapshot().refused == 1);

        clients.remove(1);
        pump_until(&mut server, |s| s.connection_count() == 2);

        for id in server.connection_ids() {
            assert!(server.mux.is_watched(id));
            assert!(server.registry.get(id).unwrap().watched);
        }
        assert_eq!(server.mux.watched_len(), server.connection_count());
    }

    #[test]
    fn shutdown_closes_listener_and_peers() {
        let mut server = RelayServer::bind(test_config(2)).unwrap();
        let mut c1 = join(&mut server);
        let addr = server.local_addr();

        server.shutdown_handle().trigger();
        server.run().unwrap();

        assert_eq!(server.connection_count(), 0);
        assert!(!server.mux.is_listener_watched());

        let mut buf = [0u8; 16];
        match c1.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
        assert!(StdTcpStream::connect(addr).is_err());
    }

    #[test]
    fn start_relay_stops_cleanly() {
        let (handle, addr) = start_relay(test_config(2)).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(handle.stats().connected, 0);
        handle.stop().unwrap();
    }
}
