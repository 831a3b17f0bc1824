//! Packet transports
//!
//! A [`Transport`] is the single owner of one kernel interception point:
//! it hands out captured packets and applies verdicts. Verdicts travel
//! back from worker threads through a cloneable [`VerdictSink`], so only
//! the transport ever touches the underlying socket.
//!
//! [`NfqTransport`] binds a real NFQUEUE; [`MemoryTransport`] is an
//! in-process loopback used by the integration tests.

mod memory;
mod transport;

pub use memory::{memory_pair, MemoryHarness, MemoryTransport};
pub use transport::NfqTransport;

use crossbeam_channel::Sender;

use crate::error::QueueError;

/// Final action for one captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireAction {
    /// Forward the packet as captured.
    Accept,
    /// Discard the packet.
    Drop,
    /// Forward with a rewritten wire image.
    AcceptMangled(Vec<u8>),
}

/// One packet pulled off a transport. The token ties the eventual
/// verdict back to the kernel-side packet it belongs to.
#[derive(Debug)]
pub struct CapturedPacket {
    pub token: u64,
    pub buf: Vec<u8>,
    pub mark: u32,
}

/// Worker-side handle for returning verdicts to the transport.
pub trait VerdictSink: Send + Clone + 'static {
    /// Queue a verdict for the packet identified by `token`.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once the transport has gone away.
    fn send(&self, token: u64, action: WireAction) -> Result<(), QueueError>;
}

/// Channel-backed sink shared by both transports.
#[derive(Debug, Clone)]
pub struct ChannelVerdictSink {
    tx: Sender<(u64, WireAction)>,
}

impl ChannelVerdictSink {
    pub(crate) fn new(tx: Sender<(u64, WireAction)>) -> Self {
        Self { tx }
    }
}

impl VerdictSink for ChannelVerdictSink {
    fn send(&self, token: u64, action: WireAction) -> Result<(), QueueError> {
        self.tx.send((token, action)).map_err(|_| QueueError::Closed)
    }
}

/// A source of captured packets plus the machinery to verdict them.
pub trait Transport {
    type Sink: VerdictSink;

    /// Queue number (or stand-in) this transport is bound to.
    fn queue_num(&self) -> u16;

    /// A sink workers use to return verdicts.
    fn sink(&self) -> Self::Sink;

    /// Block until the next packet, applying pending verdicts while
    /// waiting.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] on orderly shutdown; any other error means
    /// the interception point is broken and is fatal.
    fn receive(&mut self) -> Result<CapturedPacket, QueueError>;

    /// Flush outstanding verdicts and release the interception point.
    /// Packets still un-verdicted after the flush are dropped.
    ///
    /// # Errors
    ///
    /// Propagates verdict or unbind failures.
    fn finish(&mut self) -> Result<(), QueueError>;
}
