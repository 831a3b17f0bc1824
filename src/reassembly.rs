//! Minimal TCP reassembly
//!
//! Converts the segment soup of one TCP connection into two ordered byte
//! streams, one per direction, so the matcher only ever sees application
//! bytes in the order the receiving peer will see them. Out-of-order
//! segments are held back (bounded), retransmitted bytes are trimmed, and
//! a SYN carrying a new initial sequence number restarts the stream.
//!
//! This is deliberately not a full TCP implementation: no window or
//! timer handling, no SACK. A connection we first observe mid-stream is
//! adopted at whatever sequence number shows up first.

use std::collections::BTreeMap;

use etherparse::TcpHeader;
use tracing::trace;

use crate::packet::Direction;

/// Cap on bytes held back per direction while waiting for a gap to fill.
/// Anything past this is dropped on the floor rather than buffered.
const MAX_HELD_BYTES: usize = 64 * 1024;

/// Outcome of feeding one segment to the reassembler.
#[derive(Debug, Default)]
pub struct Delivery {
    /// New in-order bytes for the segment's direction. Empty for pure
    /// acks, duplicates, and segments that only fill the hold-back buffer.
    pub data: Vec<u8>,
    /// The stream restarted (SYN with a fresh initial sequence number on
    /// an already-tracked flow). All per-stream scanner and offset state
    /// belongs to the old incarnation and must be discarded.
    pub restarted: bool,
}

#[derive(Debug, Default)]
struct DirState {
    /// Sequence number of stream byte 0 for this direction.
    base: Option<u32>,
    /// Relative offset of the next expected byte.
    next: u32,
    /// Out-of-order segments keyed by relative offset.
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
    fin_seen: bool,
}

impl DirState {
    fn clear(&mut self) {
        *self = Self::default();
    }

    /// Ingest one segment's payload at relative offset `rel`.
    fn ingest(&mut self, mut rel: u32, mut payload: &[u8]) -> Vec<u8> {
        if payload.is_empty() {
            return Vec::new();
        }

        // Entirely already-delivered bytes: plain retransmit.
        let end = rel.wrapping_add(payload.len() as u32);
        if end.wrapping_sub(self.next) as i32 <= 0 {
            return Vec::new();
        }
        // Partial retransmit: trim the prefix we already delivered.
        let lag = self.next.wrapping_sub(rel) as i32;
        if lag > 0 {
            payload = &payload[lag as usize..];
            rel = self.next;
        }

        if rel != self.next {
            // Gap ahead of us, hold the segment back.
            if self.pending_bytes + payload.len() > MAX_HELD_BYTES {
                trace!(rel, len = payload.len(), "hold-back buffer full, segment dropped");
                return Vec::new();
            }
            if !self.pending.contains_key(&rel) {
                self.pending_bytes += payload.len();
                self.pending.insert(rel, payload.to_vec());
            }
            return Vec::new();
        }

        let mut out = payload.to_vec();
        self.next = self.next.wrapping_add(payload.len() as u32);

        // Drain held segments the new bytes made contiguous.
        while let Some((&held_rel, _)) = self.pending.first_key_value() {
            if held_rel.wrapping_sub(self.next) as i32 > 0 {
                break;
            }
            let held = self.pending.remove(&held_rel).unwrap_or_default();
            self.pending_bytes -= held.len();
            let overlap = self.next.wrapping_sub(held_rel) as usize;
            if overlap < held.len() {
                out.extend_from_slice(&held[overlap..]);
                self.next = held_rel.wrapping_add(held.len() as u32);
            }
        }
        out
    }
}

/// Per-connection reassembler, both directions.
#[derive(Debug, Default)]
pub struct TcpReassembler {
    client_to_server: DirState,
    server_to_client: DirState,
    reset: bool,
}

impl TcpReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn dir(&mut self, direction: Direction) -> &mut DirState {
        match direction {
            Direction::ClientToServer => &mut self.client_to_server,
            Direction::ServerToClient => &mut self.server_to_client,
        }
    }

    /// Feed one segment. Returns the newly contiguous bytes (if any) and
    /// whether the flow restarted under a new SYN.
    pub fn feed(&mut self, direction: Direction, tcp: &TcpHeader, payload: &[u8]) -> Delivery {
        if tcp.rst {
            self.reset = true;
            return Delivery::default();
        }

        let mut restarted = false;
        if tcp.syn {
            // Data on a SYN segment logically starts one past the ISN.
            let base = tcp.sequence_number.wrapping_add(1);
            let state = self.dir(direction);
            let known = *state.base.get_or_insert(base);
            if known != base {
                // Fresh connection reusing the flow tuple.
                self.client_to_server.clear();
                self.server_to_client.clear();
                self.reset = false;
                restarted = true;
                self.dir(direction).base = Some(base);
            }
        }

        let state = self.dir(direction);
        let seq = if tcp.syn {
            tcp.sequence_number.wrapping_add(1)
        } else {
            tcp.sequence_number
        };
        // Flow adopted mid-stream: whatever arrives first defines byte 0.
        let base = *state.base.get_or_insert(seq);
        let rel = seq.wrapping_sub(base);

        let data = state.ingest(rel, payload);
        if tcp.fin {
            state.fin_seen = true;
        }

        Delivery { data, restarted }
    }

    /// Both half-closes observed, or the connection was reset. The caller
    /// can drop all per-stream state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.reset || (self.client_to_server.fin_seen && self.server_to_client.fin_seen)
    }
}
