// Error types for the relay.
//
// Three families, matching how far a failure reaches:
// - `RelayError`: listener and event-loop failures. `Bind`, `Listen` and
//   `Setup` happen before the loop starts and abort startup. `Wait` is the
//   only failure that stops a running loop. `Accept` and `Watch` are logged
//   by the loop and never escape it.
// - `RegistryError`: admission refusals from the connection registry.
// - `DeliveryError`: a single peer could not take a broadcast payload. Handled
//   according to the configured `WriteFailurePolicy`.

use std::io;
use std::net::SocketAddr;

use crate::registry::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr} (backlog {backlog}): {source}")]
    Listen {
        addr: SocketAddr,
        backlog: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to set up the event loop: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to watch connection {id}: {source}")]
    Watch {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },

    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("relay thread panicked")]
    ThreadPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("relay is full ({capacity} connections)")]
    CapacityExceeded { capacity: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("write failed: {0}")]
    Io(#[source] io::Error),

    #[error("socket accepted zero bytes")]
    WriteZero,

    #[error("pending output would exceed {limit} bytes")]
    Backlogged { limit: usize },
}
