//! Per-client RPC session state.
//!
//! One of these exists per connected client. It owns the streaming
//! decoder for the inbound byte stream and the outbound message queue.
//!
//! Writes are coalesced: queueing only *starts* a write when none is in
//! flight; everything queued while one is pending goes out as a single
//! buffer when the in-flight write completes. The reactor keeps exactly
//! one outstanding read armed on the socket for as long as the session
//! is open — that flow lives in the server, this struct is the state.
//!
//! Back-pressure: a slow client's queue is capped. Past the cap, the
//! oldest `redraw` for any session that has a newer one queued is
//! dropped first (full frames are idempotent, only the newest matters);
//! if that cannot get the queue under the cap, the client is closed.

use std::collections::{HashMap, VecDeque};

use super::codec::{Message, MessageDecoder, ProtocolError};
use crate::reactor::TaskId;

/// Outbound queue cap per client (16 MB).
pub const OUTBOUND_CAP: usize = 16 * 1024 * 1024;

/// What a queued outbound message is, for the drop predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    /// A `redraw` notification for the given session.
    Redraw { session: u64 },
    /// Everything else; never dropped.
    Other,
}

#[derive(Debug)]
struct Outbound {
    bytes: Vec<u8>,
    kind: OutboundKind,
}

/// Result of queueing an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// No write in flight: caller should take a batch and submit one.
    StartWrite,
    /// A write is already in flight; the bytes ride along later.
    WriteInFlight,
    /// The queue is over cap even after dropping stale redraws.
    Overflow,
}

/// A server-initiated request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: String,
}

#[derive(Debug, Default)]
pub struct RpcSession {
    decoder: MessageDecoder,
    outbound: VecDeque<Outbound>,
    queued_bytes: usize,
    write_task: Option<TaskId>,
    next_request_id: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl RpcSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from a completed socket read.
    ///
    /// # Errors
    ///
    /// Propagates protocol violations; the caller closes the client.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        self.decoder.feed(bytes)
    }

    /// Queue an encoded message for delivery.
    pub fn queue(&mut self, bytes: Vec<u8>, kind: OutboundKind) -> QueueOutcome {
        self.queued_bytes += bytes.len();
        self.outbound.push_back(Outbound { bytes, kind });
        if !self.enforce_cap() {
            return QueueOutcome::Overflow;
        }
        if self.write_task.is_some() {
            QueueOutcome::WriteInFlight
        } else {
            QueueOutcome::StartWrite
        }
    }

    /// Coalesce the whole queue into one write buffer.
    #[must_use]
    pub fn take_write_batch(&mut self) -> Option<Vec<u8>> {
        if self.outbound.is_empty() {
            return None;
        }
        let mut batch = Vec::with_capacity(self.queued_bytes);
        for entry in self.outbound.drain(..) {
            batch.extend_from_slice(&entry.bytes);
        }
        self.queued_bytes = 0;
        Some(batch)
    }

    /// Record the in-flight write task.
    pub fn write_started(&mut self, task: TaskId) {
        self.write_task = Some(task);
    }

    /// The in-flight write finished (or failed); clears the slot.
    pub fn write_finished(&mut self) {
        self.write_task = None;
    }

    #[must_use]
    pub fn write_in_flight(&self) -> bool {
        self.write_task.is_some()
    }

    /// Bytes currently queued (excludes the in-flight buffer).
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Allocate the next request id for a server-initiated request.
    ///
    /// Wraps at `u32::MAX` and never hands out an id that still sits in
    /// the pending map.
    pub fn next_request(&mut self, method: &str) -> u32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = self.next_request_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                self.pending.insert(
                    id,
                    PendingRequest {
                        method: method.to_string(),
                    },
                );
                return id;
            }
        }
    }

    /// Fulfill a pending request by response id.
    ///
    /// `None` means the id is unknown; the caller logs and drops.
    pub fn fulfill(&mut self, id: u32) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Drop queue entries until the cap holds. Returns false when it
    /// cannot.
    fn enforce_cap(&mut self) -> bool {
        while self.queued_bytes > OUTBOUND_CAP {
            let Some(idx) = self.droppable_redraw() else {
                return false;
            };
            if let Some(dropped) = self.outbound.remove(idx) {
                self.queued_bytes -= dropped.bytes.len();
                log::debug!("outbound over cap, dropped stale redraw ({} bytes)", dropped.bytes.len());
            }
        }
        true
    }

    /// Oldest redraw that has a newer redraw for the same session behind
    /// it in the queue.
    fn droppable_redraw(&self) -> Option<usize> {
        for (idx, entry) in self.outbound.iter().enumerate() {
            if let OutboundKind::Redraw { session } = entry.kind {
                let superseded = self
                    .outbound
                    .iter()
                    .skip(idx + 1)
                    .any(|later| later.kind == OutboundKind::Redraw { session });
                if superseded {
                    return Some(idx);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redraw(session: u64, len: usize) -> (Vec<u8>, OutboundKind) {
        (vec![0u8; len], OutboundKind::Redraw { session })
    }

    #[test]
    fn test_first_queue_starts_a_write() {
        let mut session = RpcSession::new();
        assert_eq!(
            session.queue(b"abc".to_vec(), OutboundKind::Other),
            QueueOutcome::StartWrite
        );
        session.write_started(1);
        assert_eq!(
            session.queue(b"def".to_vec(), OutboundKind::Other),
            QueueOutcome::WriteInFlight
        );
    }

    #[test]
    fn test_write_batch_coalesces_in_order() {
        let mut session = RpcSession::new();
        session.queue(b"ab".to_vec(), OutboundKind::Other);
        session.queue(b"cd".to_vec(), OutboundKind::Other);
        assert_eq!(session.take_write_batch().unwrap(), b"abcd".to_vec());
        assert!(session.take_write_batch().is_none());
        assert_eq!(session.queued_bytes(), 0);
    }

    #[test]
    fn test_cap_drops_oldest_redraw_keeps_newest() {
        let mut session = RpcSession::new();
        session.write_started(1); // pin the queue

        let big = OUTBOUND_CAP / 2 + 1;
        let (bytes, kind) = redraw(9, big);
        session.queue(bytes, kind);
        let (bytes, kind) = redraw(9, big);
        session.queue(bytes, kind);
        // Third redraw pushes over cap; the oldest one goes.
        let (mut bytes, kind) = redraw(9, big);
        bytes[0] = 0xEE; // marker on the newest
        assert_eq!(session.queue(bytes, kind), QueueOutcome::WriteInFlight);

        let batch = session.take_write_batch().unwrap();
        assert!(batch.len() <= OUTBOUND_CAP);
        // The newest redraw survived.
        assert_eq!(batch[batch.len() - big], 0xEE);
    }

    #[test]
    fn test_cap_never_drops_non_redraw_traffic() {
        let mut session = RpcSession::new();
        session.write_started(1);
        session.queue(vec![1u8; OUTBOUND_CAP], OutboundKind::Other);
        assert_eq!(
            session.queue(vec![2u8; 16], OutboundKind::Other),
            QueueOutcome::Overflow
        );
    }

    #[test]
    fn test_redraws_for_other_sessions_are_not_superseded() {
        let mut session = RpcSession::new();
        session.write_started(1);
        let big = OUTBOUND_CAP / 2 + 1;
        let (bytes, kind) = redraw(1, big);
        session.queue(bytes, kind);
        // Different session: the first redraw is still the newest for
        // its session and must not be dropped.
        let (bytes, kind) = redraw(2, big);
        assert_eq!(session.queue(bytes, kind), QueueOutcome::Overflow);
    }

    #[test]
    fn test_request_id_allocation_skips_pending() {
        let mut session = RpcSession::new();
        let a = session.next_request("ping");
        let b = session.next_request("ping");
        assert_ne!(a, b);

        assert!(session.fulfill(a).is_some());
        assert!(session.fulfill(a).is_none(), "double fulfill is unknown");
        assert!(session.fulfill(9999).is_none(), "unknown id is dropped");
        assert!(session.fulfill(b).is_some());
    }

    #[test]
    fn test_feed_delegates_to_streaming_decoder() {
        let mut session = RpcSession::new();
        let msg = Message::notification("bell", vec![]);
        let wire = msg.encode();
        let mid = wire.len() / 2;
        assert!(session.feed(&wire[..mid]).unwrap().is_empty());
        assert_eq!(session.feed(&wire[mid..]).unwrap(), vec![msg]);
    }
}
