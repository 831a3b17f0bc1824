//! Per-worker stream table
//!
//! Each worker owns the state of the streams sharded onto it: sequence
//! offsets, the reassembler, and the blocked flag once a rule has hit.
//! Nothing here is shared; a stream lives and dies on one worker.
//!
//! Datagram flows get a separate, capacity-bounded blocklist: they have
//! no teardown to release an entry, so the oldest block is evicted when
//! the list fills instead of the table growing without bound.

use std::collections::{HashMap, VecDeque};

use crate::offsets::SeqOffsets;
use crate::packet::StreamIdentity;
use crate::reassembly::TcpReassembler;

#[derive(Debug, Default)]
pub struct StreamState {
    pub offsets: SeqOffsets,
    pub reasm: TcpReassembler,
    /// Token of the rule that blocked this stream, once matched.
    pub blocked: Option<String>,
}

impl StreamState {
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Discard everything tied to the old incarnation of the flow (new
    /// SYN on a reused tuple). The blocked flag goes too: a fresh
    /// connection has not matched anything yet.
    pub fn restart(&mut self) {
        self.offsets.reset();
        self.blocked = None;
    }
}

#[derive(Debug, Default)]
pub struct StreamTable {
    map: HashMap<StreamIdentity, StreamState>,
}

impl StreamTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, sid: StreamIdentity) -> &mut StreamState {
        self.map.entry(sid).or_default()
    }

    /// Idempotent removal on stream teardown.
    pub fn remove(&mut self, sid: &StreamIdentity) {
        self.map.remove(sid);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Default cap on remembered blocked datagram flows per worker.
const DATAGRAM_BLOCK_CAP: usize = 4096;

/// Blocked UDP/raw flows. FIFO-bounded: once full, blocking a new flow
/// forgets the oldest one (which then falls back to per-packet scanning).
#[derive(Debug)]
pub struct DatagramBlocklist {
    map: HashMap<StreamIdentity, String>,
    order: VecDeque<StreamIdentity>,
    capacity: usize,
}

impl Default for DatagramBlocklist {
    fn default() -> Self {
        Self::with_capacity(DATAGRAM_BLOCK_CAP)
    }
}

impl DatagramBlocklist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn is_blocked(&self, sid: &StreamIdentity) -> bool {
        self.map.contains_key(sid)
    }

    pub fn block(&mut self, sid: StreamIdentity, token: String) {
        if self.map.insert(sid, token).is_some() {
            return;
        }
        self.order.push_back(sid);
        while self.map.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
