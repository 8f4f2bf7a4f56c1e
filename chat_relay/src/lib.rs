// chat_relay: single-process, event-multiplexed TCP broadcast relay.
//
// The relay accepts many concurrent TCP connections, watches all of them plus
// its listening socket with one readiness wait, and forwards every chunk of
// bytes read from one peer to every other connected peer. There is no wire
// protocol: payloads are relayed verbatim, and a line-oriented terminal
// client (`client.rs`, `bin/chat.rs`) is the expected peer.
//
// Module overview:
// - `registry.rs`:    Bounded `ConnectionRegistry` of live peers, keyed by
//                     never-reused `ConnectionId`s, with snapshot iteration
//                     for broadcast.
// - `multiplexer.rs`: `Multiplexer` over `mio::Poll`: watch, unwatch, wait.
// - `listener.rs`:    Bind (address reuse, explicit backlog) and accept.
// - `broadcast.rs`:   Fan-out of one payload to all peers but the sender,
//                     per-peer outboxes for non-blocking writes, and the
//                     `WriteFailurePolicy`.
// - `server.rs`:      `RelayServer` context and the dispatch loop, graceful
//                     shutdown, and `start_relay` for embedding.
// - `stats.rs`:       Atomic counters and a serializable snapshot.
// - `client.rs`:      Thread-backed TCP client used by `chat` and the tests.
// - `error.rs`:       Error enums.
//
// The library only emits `tracing` events. Both binaries call
// `init_tracing` to install a subscriber.

pub mod broadcast;
pub mod client;
pub mod error;
pub mod listener;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod stats;

pub use broadcast::WriteFailurePolicy;
pub use error::{DeliveryError, RegistryError, RelayError};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::{RelayConfig, RelayHandle, RelayServer, ShutdownHandle, start_relay};
pub use stats::StatsSnapshot;

/// Install the fmt subscriber used by the binaries. The filter comes from
/// `CHAT_RELAY_LOG` (same syntax as `RUST_LOG`), defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CHAT_RELAY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
