// Test-only peer for relay integration tests.
//
// Wraps the real `ChatClient` (from `chat_relay::client`) to provide a
// synchronous, test-friendly API: send bytes, then block until an expected
// byte count has arrived, until the relay closes the connection, or until a
// quiet period passes with nothing received.
//
// The only test-specific code here is the blocking loops around
// `ChatClient::recv_timeout()` plus `wait_for`, which polls the relay's
// stats. All networking uses the same code path as the `chat` binary.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use chat_relay::client::{ChatClient, ClientEvent};
use chat_relay::server::{RelayConfig, RelayHandle, start_relay};
use chat_relay::stats::StatsSnapshot;

/// Default timeout for blocking operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep duration between stats polls.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long `expect_silence` listens.
const QUIET_PERIOD: Duration = Duration::from_millis(150);

/// Relay config for tests: localhost, OS-assigned port.
pub fn local_config(max_connections: usize) -> RelayConfig {
    RelayConfig {
        bind_address: [127, 0, 0, 1].into(),
        port: 0,
        max_connections,
        ..RelayConfig::default()
    }
}

/// Start a relay with `config` and return its handle and address.
pub fn spawn_relay(config: RelayConfig) -> (RelayHandle, SocketAddr) {
    start_relay(config).expect("start_relay failed")
}

/// Block until `cond` holds for the relay's stats.
pub fn wait_for(handle: &RelayHandle, what: &str, cond: impl Fn(&StatsSnapshot) -> bool) {
    let start = Instant::now();
    loop {
        let stats = handle.stats();
        if cond(&stats) {
            return;
        }
        assert!(
            start.elapsed() < POLL_TIMEOUT,
            "timed out waiting for {what}; stats: {stats:?}"
        );
        thread::sleep(POLL_INTERVAL);
    }
}

/// A test peer wrapping a real ChatClient.
pub struct TestPeer {
    pub name: String,
    client: ChatClient,
    /// Bytes received but not yet consumed by an `expect_*` call.
    pending: Vec<u8>,
    closed: bool,
}

impl TestPeer {
    /// Connect without waiting for the relay to admit or refuse.
    pub fn connect(addr: SocketAddr, name: &str) -> Self {
        let client = ChatClient::connect(addr)
            .unwrap_or_else(|e| panic!("{name}: connect failed: {e}"));
        Self {
            name: name.to_string(),
            client,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Connect and block until the relay has decided on this peer (admitted
    /// or refused, per its stats).
    pub fn join(handle: &RelayHandle, addr: SocketAddr, name: &str) -> Self {
        let before = handle.stats();
        let peer = Self::connect(addr, name);
        wait_for(handle, &format!("{name} to be admitted or refused"), |s| {
            s.accepted + s.refused > before.accepted + before.refused
        });
        peer
    }

    pub fn say(&mut self, bytes: &[u8]) {
        let name = &self.name;
        self.client
            .send(bytes)
            .unwrap_or_else(|e| panic!("{name}: send failed: {e}"));
    }

    pub fn say_line(&mut self, line: &str) {
        let name = &self.name;
        self.client
            .send_line(line)
            .unwrap_or_else(|e| panic!("{name}: send failed: {e}"));
    }

    /// Block until exactly `len` bytes have arrived and return them. Extra
    /// bytes stay buffered for the next call.
    pub fn expect_bytes(&mut self, len: usize) -> Vec<u8> {
        self.expect_bytes_within(len, POLL_TIMEOUT)
    }

    pub fn expect_bytes_within(&mut self, len: usize, timeout: Duration) -> Vec<u8> {
        let start = Instant::now();
        while self.pending.len() < len {
            let remaining = timeout.saturating_sub(start.elapsed());
            assert!(
                !remaining.is_zero(),
                "{}: timed out with {} of {len} bytes",
                self.name,
                self.pending.len()
            );
            match self.client.recv_timeout(remaining) {
                Some(ClientEvent::Data(bytes)) => self.pending.extend(bytes),
                Some(ClientEvent::Closed) => panic!(
                    "{}: closed after {} of {len} bytes",
                    self.name,
                    self.pending.len()
                ),
                None => {}
            }
        }
        self.pending.drain(..len).collect()
    }

    /// Assert nothing arrives during a short quiet period.
    pub fn expect_silence(&mut self) {
        assert!(
            self.pending.is_empty(),
            "{}: unconsumed bytes {:?}",
            self.name,
            String::from_utf8_lossy(&self.pending)
        );
        match self.client.recv_timeout(QUIET_PERIOD) {
            None => {}
            Some(ClientEvent::Data(bytes)) => panic!(
                "{}: expected silence, got {:?}",
                self.name,
                String::from_utf8_lossy(&bytes)
            ),
            Some(ClientEvent::Closed) => panic!("{}: expected silence, got close", self.name),
        }
    }

    /// Block until the relay closes this connection. Bytes received before
    /// the close are returned.
    pub fn expect_closed(&mut self) -> Vec<u8> {
        let start = Instant::now();
        while !self.closed {
            let remaining = POLL_TIMEOUT.saturating_sub(start.elapsed());
            assert!(!remaining.is_zero(), "{}: never closed", self.name);
            match self.client.recv_timeout(remaining) {
                Some(ClientEvent::Data(bytes)) => self.pending.extend(bytes),
                Some(ClientEvent::Closed) => self.closed = true,
                None => {}
            }
        }
        std::mem::take(&mut self.pending)
    }

    /// Leave with an orderly shutdown.
    pub fn leave(self) {
        self.client.disconnect();
    }
}
