// CLI entry point for the chat relay.
//
// Binds the listening socket, then runs the dispatch loop on the main thread
// until the process is terminated. Bind and listen failures are reported and
// exit with status 1 before the loop starts; a readiness-wait failure inside
// the loop is fatal and also exits with status 1. See `server.rs` for the
// loop itself.
//
// Usage:
//   relay [OPTIONS]
//     --bind <ADDR>               Bind address (default: 0.0.0.0)
//     --port <PORT>               Listen port (default: 8080)
//     --backlog <N>               Listen backlog (default: 5)
//     --max-connections <N>       Max concurrent peers (default: 30)
//     --read-buffer <BYTES>       Bytes per socket read (default: 1024)
//     --max-pending-bytes <BYTES> Per-peer queued output limit (default: 1 MiB)
//     --write-failures <POLICY>   eager | lazy (default: eager)
//
// Log filtering: `CHAT_RELAY_LOG` (e.g. `CHAT_RELAY_LOG=debug`).

use std::net::IpAddr;

use clap::{Parser, ValueEnum};
use tracing::error;

use chat_relay::server::{RelayConfig, RelayServer};
use chat_relay::{WriteFailurePolicy, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Broadcast every peer's bytes to every other peer")]
struct Args {
    /// Address to bind the listening socket to.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on (0 lets the OS pick).
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Listen backlog.
    #[arg(long, default_value_t = chat_relay::listener::DEFAULT_BACKLOG)]
    backlog: i32,

    /// Maximum number of concurrent peers; extra connections are closed.
    #[arg(long, default_value_t = 30)]
    max_connections: usize,

    /// Bytes read from a peer per socket read.
    #[arg(long = "read-buffer", default_value_t = 1024)]
    read_buffer_size: usize,

    /// Output queued for one slow peer before it counts as a write failure.
    #[arg(long, default_value_t = 1024 * 1024)]
    max_pending_bytes: usize,

    /// What to do with a peer whose broadcast write fails.
    #[arg(long = "write-failures", value_enum, default_value_t = PolicyArg::Eager)]
    write_failures: PolicyArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    /// Drop the peer immediately.
    Eager,
    /// Leave the peer until its own next read fails.
    Lazy,
}

impl From<PolicyArg> for WriteFailurePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Eager => WriteFailurePolicy::Eager,
            PolicyArg::Lazy => WriteFailurePolicy::Lazy,
        }
    }
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        RelayConfig {
            bind_address: args.bind,
            port: args.port,
            backlog: args.backlog,
            max_connections: args.max_connections,
            read_buffer_size: args.read_buffer_size,
            max_pending_bytes: args.max_pending_bytes,
            write_failure_policy: args.write_failures.into(),
            ..RelayConfig::default()
        }
    }
}

fn main() {
    init_tracing();
    let config = RelayConfig::from(Args::parse());

    let mut server = match RelayServer::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            eprintln!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    println!("Chat relay listening on {}", server.local_addr());

    if let Err(e) = server.run() {
        eprintln!("Relay stopped: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let args = Args::try_parse_from(["relay"]).unwrap();
        let config = RelayConfig::from(args);
        let defaults = RelayConfig::default();
        assert_eq!(config.socket_addr(), defaults.socket_addr());
        assert_eq!(config.backlog, defaults.backlog);
        assert_eq!(config.max_connections, defaults.max_connections);
        assert_eq!(config.read_buffer_size, defaults.read_buffer_size);
        assert_eq!(config.max_pending_bytes, defaults.max_pending_bytes);
        assert_eq!(config.write_failure_policy, WriteFailurePolicy::Eager);
    }

    #[test]
    fn flags_map_onto_config() {
        let args = Args::try_parse_from([
            "relay",
            "--bind",
            "127.0.0.1",
            "--port",
            "9000",
            "--max-connections",
            "2",
            "--write-failures",
            "lazy",
        ])
        .unwrap();
        let config = RelayConfig::from(args);
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.write_failure_policy, WriteFailurePolicy::Lazy);
    }

    #[test]
    fn rejects_unknown_policy() {
        assert!(Args::try_parse_from(["relay", "--write-failures", "never"]).is_err());
    }
}
