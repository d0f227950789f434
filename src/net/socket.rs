//! The socket control block and the rendezvous queue a `Connect` parks on.
//!
//! Everything here is plain data; the state machine (binding, listening,
//! accepting, connecting, tearing down) lives on `Kernel`, which is the only
//! thing that ever touches these fields, always under the single kernel
//! lock. See `kernel.rs` for the refcount discipline this module assumes:
//! a freshly created SCB starts at `refcount == 1` (owned by the fd that
//! holds it); `Connect`/`Accept` each take one extra reference for the
//! duration of a blocking wait and drop it again on wake, freeing the SCB
//! through the same decrement-and-maybe-free helper `Close` uses.

use std::collections::VecDeque;

use crate::sched::Cv;

pub type SockId = usize;

/// A still-pending `Connect` parked on a listener's queue.
///
/// Resolution is by state transition, not by a shared mutable flag: `Accept`
/// admits a request by flipping the connector's own SCB to `Peer` directly,
/// and the blocked `Connect` simply checks what its own socket became after
/// waking. Whichever side reaches a terminal outcome first — `Accept`
/// admitting it, or `Connect` timing out — removes the request from the
/// listener's queue under the lock, so the other side can never act on it
/// twice.
pub struct ConnRequest {
    pub id: u64,
    pub connector: SockId,
    /// Shared with the waiting `Connect` call; cloning just bumps the
    /// underlying `Arc<Condvar>` refcount, so both sides broadcast/wait on
    /// the same condition.
    pub connected_cv: Cv,
}

pub enum SockPayload {
    Unbound,
    Listener {
        queue: VecDeque<ConnRequest>,
        req_available: Cv,
    },
    Peer {
        peer: SockId,
        read_pipe: Option<usize>,
        write_pipe: Option<usize>,
    },
}

/// Where a still-`Unbound` SCB's own `Connect` request is parked, so a
/// `Close` racing the blocked call can find and retract it without needing
/// to scan every listener's queue.
#[derive(Clone, Copy)]
pub struct PendingConnect {
    pub listener: SockId,
    pub request_id: u64,
}

pub struct Scb {
    pub refcount: u32,
    pub port: u16,
    pub payload: SockPayload,
    /// Set by `Close` (and only ever read by a blocked `Connect` on wake):
    /// the application gave this fid up while the wait was still in flight.
    pub closed: bool,
    pub pending_connect: Option<PendingConnect>,
}

impl Scb {
    /// A freshly `Socket()`-ed SCB: unbound, owned by exactly the fd that
    /// was just handed back to the caller.
    pub fn new(port: u16) -> Self {
        Scb {
            refcount: 1,
            port,
            payload: SockPayload::Unbound,
            closed: false,
            pending_connect: None,
        }
    }

    pub fn is_unbound(&self) -> bool {
        matches!(self.payload, SockPayload::Unbound)
    }

    pub fn as_listener_mut(&mut self) -> Option<(&mut VecDeque<ConnRequest>, &Cv)> {
        match &mut self.payload {
            SockPayload::Listener {
                queue,
                req_available,
            } => Some((queue, req_available)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_socket_is_unbound_with_one_reference() {
        let s = Scb::new(1024);
        assert!(s.is_unbound());
        assert_eq!(s.refcount, 1);
    }
}
