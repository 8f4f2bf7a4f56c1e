// Listening socket lifecycle: bind, listen, accept.
//
// `start` builds the socket with `socket2` so address reuse and the listen
// backlog can be set explicitly (a restarted relay must not fail to bind
// while the previous socket lingers in TIME_WAIT), then hands it to `mio` as
// a non-blocking listener.
//
// `accept` is called only when the multiplexer reports the listener ready.
// It returns `Ok(None)` once the pending queue is drained, which the
// edge-triggered loop in `server.rs` relies on.

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::RelayError;

/// Listen backlog used when none is configured.
pub const DEFAULT_BACKLOG: i32 = 5;

/// Bind `addr` with address reuse enabled and start listening.
pub fn start(addr: SocketAddr, backlog: i32) -> Result<TcpListener, RelayError> {
    let bind_err = |source| RelayError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;

    let listen_err = |source| RelayError::Listen {
        addr,
        backlog,
        source,
    };
    socket.listen(backlog).map_err(listen_err)?;
    socket.set_nonblocking(true).map_err(listen_err)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Accept one pending connection. Returns `Ok(None)` when nothing is pending.
///
/// Aborted or reset handshakes are skipped. Any other error is returned as
/// `RelayError::Accept`; the caller logs it and keeps running.
pub fn accept(listener: &TcpListener) -> Result<Option<(TcpStream, SocketAddr)>, RelayError> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%peer_addr, error = %e, "set_nodelay failed");
                }
                return Ok(Some((stream, peer_addr)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                tracing::debug!(error = %e, "transient accept error");
                continue;
            }
            Err(e) => return Err(RelayError::Accept(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Accept with a deadline; the listener is non-blocking.
    fn accept_within(listener: &TcpListener, timeout: Duration) -> Option<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(pair) = accept(listener).unwrap() {
                return Some(pair);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn start_binds_ephemeral_port() {
        let listener = start(loopback(), DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn accept_with_nothing_pending_returns_none() {
        let listener = start(loopback(), DEFAULT_BACKLOG).unwrap();
        assert!(accept(&listener).unwrap().is_none());
    }

    #[test]
    fn accept_returns_pending_peer() {
        let listener = start(loopback(), DEFAULT_BACKLOG).unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let (_stream, peer_addr) =
            accept_within(&listener, Duration::from_secs(5)).expect("no connection accepted");
        assert_eq!(peer_addr, client.local_addr().unwrap());
    }

    #[test]
    fn bind_to_address_in_use_fails_with_bind_error() {
        // An actively listening socket holds the port exclusively even with
        // SO_REUSEADDR set on both sides.
        let first = start(loopback(), DEFAULT_BACKLOG).unwrap();
        let taken = first.local_addr().unwrap();

        let err = start(taken, DEFAULT_BACKLOG).unwrap_err();
        match err {
            RelayError::Bind { addr, .. } => assert_eq!(addr, taken),
            other => panic!("expected Bind error, got {other:?}"),
        }
    }

    #[test]
    fn rebind_after_close_succeeds() {
        let listener = start(loopback(), DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();

        // Leave a connection behind so the old socket has teardown state.
        let client = std::net::TcpStream::connect(addr).unwrap();
        let accepted = accept_within(&listener, Duration::from_secs(5));
        drop(accepted);
        drop(client);
        drop(listener);

        let again = start(addr, DEFAULT_BACKLOG).unwrap();
        assert_eq!(again.local_addr().unwrap(), addr);
    }
}
