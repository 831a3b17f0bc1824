//! TCP sequence-space bookkeeping after length-changing rewrites
//!
//! Replacing a TCP payload with one of a different length desynchronizes
//! the sequence space between the two peers: every later segment in the
//! mangled direction carries sequence numbers the far side never saw, and
//! every segment in the opposite direction acknowledges them. One
//! [`SeqOffsets`] per stream accumulates the byte deltas and rewrites both
//! numbers on every subsequent segment so neither peer notices.
//!
//! The adjustment is applied at packet intake, before any scanning, so
//! the decision path always sees a packet consistent with what the peers
//! believe the stream looks like.

use crate::packet::{Direction, PacketView};

/// Accumulated payload-length deltas for one TCP stream, one per direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeqOffsets {
    client_to_server: i64,
    server_to_client: i64,
}

impl SeqOffsets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn get(&self, direction: Direction) -> i64 {
        match direction {
            Direction::ClientToServer => self.client_to_server,
            Direction::ServerToClient => self.server_to_client,
        }
    }

    fn get_mut(&mut self, direction: Direction) -> &mut i64 {
        match direction {
            Direction::ClientToServer => &mut self.client_to_server,
            Direction::ServerToClient => &mut self.server_to_client,
        }
    }

    /// True when no rewrite ever changed a payload length on this stream.
    #[must_use]
    pub const fn is_neutral(&self) -> bool {
        self.client_to_server == 0 && self.server_to_client == 0
    }

    /// Rewrite the seq/ack numbers of an incoming segment.
    ///
    /// The segment's own direction determines which offset shifts its
    /// sequence number; its acknowledgment number tracks bytes flowing the
    /// other way, so the opposite offset is subtracted from it.
    pub fn apply(&self, view: &mut PacketView, direction: Direction) {
        view.shift_seq(self.get(direction));
        view.shift_ack(-self.get(direction.opposite()));
    }

    /// Record a payload-length delta caused by a rewrite in `direction`.
    /// Only called after the rewritten packet was actually accepted.
    pub fn record(&mut self, direction: Direction, delta: i64) {
        *self.get_mut(direction) += delta;
    }

    /// Forget all accumulated deltas (stream teardown or SYN restart).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn packet(seq: u32, ack: u32, payload: &[u8], mark: u32) -> PacketView {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(4000, 80, seq, 1024)
            .ack(ack);
        let mut raw = Vec::new();
        builder.write(&mut raw, payload).unwrap();
        PacketView::parse(raw, mark).unwrap()
    }

    #[test]
    fn test_neutral_offsets_touch_nothing() {
        let offsets = SeqOffsets::new();
        let mut view = packet(1000, 2000, b"data", 1);
        let direction = view.direction();
        offsets.apply(&mut view, direction);
        assert!(!view.is_dirty());
        assert_eq!(view.tcp().unwrap().sequence_number, 1000);
        assert_eq!(view.tcp().unwrap().acknowledgment_number, 2000);
    }

    #[test]
    fn test_shrinking_rewrite_shifts_both_directions() {
        let mut offsets = SeqOffsets::new();
        // A client-to-server payload shrank by 10 bytes.
        offsets.record(Direction::ClientToServer, -10);

        // Later client-to-server segments sit 10 bytes too far ahead.
        let mut inbound = packet(1110, 500, b"more", 1);
        offsets.apply(&mut inbound, Direction::ClientToServer);
        assert_eq!(inbound.tcp().unwrap().sequence_number, 1100);
        // Their acks track the untouched opposite direction.
        assert_eq!(inbound.tcp().unwrap().acknowledgment_number, 500);

        // Server replies acknowledge 10 bytes the server never received.
        let mut outbound = packet(500, 1100, b"", 0);
        offsets.apply(&mut outbound, Direction::ServerToClient);
        assert_eq!(outbound.tcp().unwrap().sequence_number, 500);
        assert_eq!(outbound.tcp().unwrap().acknowledgment_number, 1110);
    }

    #[test]
    fn test_growing_rewrite_accumulates() {
        let mut offsets = SeqOffsets::new();
        offsets.record(Direction::ServerToClient, 7);
        offsets.record(Direction::ServerToClient, 3);

        let mut outbound = packet(2000, 900, b"x", 0);
        offsets.apply(&mut outbound, Direction::ServerToClient);
        assert_eq!(outbound.tcp().unwrap().sequence_number, 2010);

        let mut inbound = packet(900, 2010, b"", 1);
        offsets.apply(&mut inbound, Direction::ClientToServer);
        assert_eq!(inbound.tcp().unwrap().acknowledgment_number, 2000);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut offsets = SeqOffsets::new();
        offsets.record(Direction::ClientToServer, 42);
        assert!(!offsets.is_neutral());
        offsets.reset();
        assert!(offsets.is_neutral());
    }
}
