// TCP client for talking to the relay.
//
// The relay has no wire protocol, so this is a thin byte pipe with the same
// shape as a terminal chat client:
// - `connect()` opens the TCP stream on the calling thread, then spawns a
//   background reader thread.
// - The reader thread reads raw chunks in a loop and pushes them into an
//   `mpsc` channel as `ClientEvent::Data`, then `ClientEvent::Closed` once the
//   relay closes the connection (or the read fails).
// - The caller keeps the write half and sends with `send` / `send_line`.
// - `poll()` drains the inbox without blocking; `recv_timeout()` waits for
//   one event.
//
// Chunk boundaries are whatever the socket delivered. Callers that care
// about message boundaries must reassemble (the relay forwards each of its
// reads verbatim, and TCP may split or merge them).
//
// Used by the `chat` binary and by the integration tests.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Line that makes a terminal client leave.
pub const QUIT_LINE: &str = "q";

const READ_CHUNK: usize = 1024;

/// Something the reader thread observed on the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Data(Vec<u8>),
    /// The relay closed the connection (or it failed). Always the last event.
    Closed,
}

/// TCP client for relay communication.
pub struct ChatClient {
    writer: TcpStream,
    inbox: Receiver<ClientEvent>,
    local_addr: SocketAddr,
    _reader_thread: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Connect to a relay and spawn the reader thread.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let writer = TcpStream::connect(addr)?;
        writer.set_nodelay(true)?;
        let local_addr = writer.local_addr()?;
        let reader = writer.try_clone()?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::Builder::new()
            .name(format!("chat-reader-{local_addr}"))
            .spawn(move || reader_loop(reader, tx))?;

        Ok(Self {
            writer,
            inbox: rx,
            local_addr,
            _reader_thread: Some(reader_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send raw bytes.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    /// Send a line, adding the trailing newline if it is missing.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        if line.ends_with('\n') {
            self.send(line.as_bytes())
        } else {
            let mut bytes = Vec::with_capacity(line.len() + 1);
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
            self.send(&bytes)
        }
    }

    /// Drain all queued events (non-blocking).
    pub fn poll(&self) -> Vec<ClientEvent> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event. Returns `None` on timeout.
    /// After `Closed` has been returned, reports `Closed` again.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        match self.inbox.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ClientEvent::Closed),
        }
    }

    /// Close both directions. The reader thread sees EOF and exits.
    pub fn disconnect(self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }

    /// Split into the write half and the event inbox, for callers that want
    /// to consume events on their own thread.
    pub fn into_parts(self) -> (TcpStream, Receiver<ClientEvent>) {
        (self.writer, self.inbox)
    }
}

/// True if `line` (with or without its line ending) is the quit sentinel.
pub fn is_quit_line(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == QUIT_LINE
}

/// Reader thread: read raw chunks in a loop, push to channel.
fn reader_loop(mut stream: TcpStream, tx: Sender<ClientEvent>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(ClientEvent::Data(buf[..n].to_vec())).is_err() {
                    return; // Caller dropped the receiver
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    let _ = tx.send(ClientEvent::Closed);
}
