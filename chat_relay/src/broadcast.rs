// Broadcast relay: fan one sender's bytes out to every other peer.
//
// `relay` walks the registry with `for_each_except`, so the sender never
// receives its own bytes and the set of targets is fixed for the duration of
// one call. Delivery to each target is independent: a failure is recorded in
// the returned `BroadcastReport` and the walk continues.
//
// Sockets are non-blocking. `deliver` writes as much as the socket takes and
// queues the rest in the connection's outbox, to be flushed by `flush` when
// the multiplexer reports the socket writable. Once a target has queued
// bytes, new payloads go behind them so per-target order is preserved. An
// outbox that would grow past `max_pending` is a delivery failure: the relay
// never blocks on, or buffers without bound for, one slow peer.
//
// What happens to a failed target is the server's decision
// (`WriteFailurePolicy`); this module only reports.

use std::io::{self, Write};

use crate::error::DeliveryError;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};

/// How the loop reacts when a broadcast write to a peer fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteFailurePolicy {
    /// Tear the peer down right after the broadcast pass.
    #[default]
    Eager,
    /// Ignore the failure and let the peer's own next read detect the dead
    /// socket. Until then it silently misses broadcasts.
    Lazy,
}

/// Outcome of handing one payload to one peer.
#[derive(Debug)]
pub enum Delivery {
    /// Fully written to the socket.
    Sent,
    /// Partly or wholly queued in the outbox.
    Queued,
    Failed(DeliveryError),
}

/// Per-call summary of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Targets the payload was written to or queued for.
    pub delivered: usize,
    /// Targets whose outbox went from empty to non-empty in this call and
    /// now need writable interest.
    pub backlogged: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, DeliveryError)>,
}

impl BroadcastReport {
    pub fn targets(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

/// Send `bytes` to every registered connection except `sender`.
pub fn relay<S: Write>(
    registry: &mut ConnectionRegistry<S>,
    sender: ConnectionId,
    bytes: &[u8],
    max_pending: usize,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    if bytes.is_empty() {
        return report;
    }

    registry.for_each_except(sender, |conn| {
        let had_pending = conn.has_pending_output();
        match deliver(conn, bytes, max_pending) {
            Delivery::Sent => report.delivered += 1,
            Delivery::Queued => {
                report.delivered += 1;
                if !had_pending {
                    report.backlogged.push(conn.id);
                }
            }
            Delivery::Failed(err) => report.failed.push((conn.id, err)),
        }
    });

    report
}

/// Write `bytes` to one connection, queueing whatever the socket will not
/// take right now.
pub fn deliver<S: Write>(conn: &mut Connection<S>, bytes: &[u8], max_pending: usize) -> Delivery {
    if conn.has_pending_output() {
        if conn.outbox.len() + bytes.len() > max_pending {
            return Delivery::Failed(DeliveryError::Backlogged { limit: max_pending });
        }
        conn.outbox.extend_from_slice(bytes);
        return Delivery::Queued;
    }

    let mut written = 0;
    while written < bytes.len() {
        match conn.stream.write(&bytes[written..]) {
            Ok(0) => return Delivery::Failed(DeliveryError::WriteZero),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Delivery::Failed(DeliveryError::Io(e)),
        }
    }

    let rest = &bytes[written..];
    if rest.is_empty() {
        return Delivery::Sent;
    }
    if rest.len() > max_pending {
        return Delivery::Failed(DeliveryError::Backlogged { limit: max_pending });
    }
    conn.outbox.extend_from_slice(rest);
    Delivery::Queued
}

/// Write queued output. Returns `Ok(true)` once the outbox is empty.
pub fn flush<S: Write>(conn: &mut Connection<S>) -> Result<bool, DeliveryError> {
    let mut written = 0;
    let result = loop {
        if written == conn.outbox.len() {
            break Ok(true);
        }
        match conn.stream.write(&conn.outbox[written..]) {
            Ok(0) => break Err(DeliveryError::WriteZero),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(DeliveryError::Io(e)),
        }
    };
    conn.outbox.drain(..written);
    result
}
