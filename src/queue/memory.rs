//! In-process loopback transport
//!
//! Drives the full dispatch/worker/verdict pipeline without a kernel
//! queue: a test harness injects raw packets with a mark, the transport
//! hands them out like captures, and every verdict is forwarded back to
//! the harness in the order it was issued.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::warn;

use super::{CapturedPacket, ChannelVerdictSink, Transport, WireAction};
use crate::error::QueueError;

pub struct MemoryTransport {
    queue_num: u16,
    injected: Receiver<(Vec<u8>, u32)>,
    next_token: u64,
    pending: usize,
    verdict_tx: Sender<(u64, WireAction)>,
    verdict_rx: Receiver<(u64, WireAction)>,
    outcomes: Sender<(u64, WireAction)>,
}

/// Test-side handle: inject packets, observe verdicts.
pub struct MemoryHarness {
    inject_tx: Sender<(Vec<u8>, u32)>,
    outcomes: Receiver<(u64, WireAction)>,
}

impl MemoryHarness {
    /// Inject one raw packet with its queue mark.
    pub fn inject(&self, buf: Vec<u8>, mark: u32) {
        self.inject_tx
            .send((buf, mark))
            .expect("transport dropped before injection finished");
    }

    /// Live view of issued verdicts, in issue order.
    #[must_use]
    pub fn outcomes(&self) -> Receiver<(u64, WireAction)> {
        self.outcomes.clone()
    }

    /// Close the injection side; the transport reports `Closed` once all
    /// outstanding verdicts have drained.
    pub fn close(self) -> Receiver<(u64, WireAction)> {
        self.outcomes
    }
}

/// Build a connected transport/harness pair.
#[must_use]
pub fn memory_pair(queue_num: u16) -> (MemoryTransport, MemoryHarness) {
    let (inject_tx, injected) = crossbeam_channel::unbounded();
    let (verdict_tx, verdict_rx) = crossbeam_channel::unbounded();
    let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
    (
        MemoryTransport {
            queue_num,
            injected,
            next_token: 0,
            pending: 0,
            verdict_tx,
            verdict_rx,
            outcomes: outcome_tx,
        },
        MemoryHarness {
            inject_tx,
            outcomes: outcome_rx,
        },
    )
}

impl MemoryTransport {
    fn flush_verdicts(&mut self) {
        while let Ok((token, action)) = self.verdict_rx.try_recv() {
            self.pending = self.pending.saturating_sub(1);
            if self.outcomes.send((token, action)).is_err() {
                warn!("verdict observer gone, outcome discarded");
            }
        }
    }
}

impl Transport for MemoryTransport {
    type Sink = ChannelVerdictSink;

    fn queue_num(&self) -> u16 {
        self.queue_num
    }

    fn sink(&self) -> ChannelVerdictSink {
        ChannelVerdictSink::new(self.verdict_tx.clone())
    }

    fn receive(&mut self) -> Result<CapturedPacket, QueueError> {
        loop {
            self.flush_verdicts();
            match self.injected.recv_timeout(Duration::from_millis(1)) {
                Ok((buf, mark)) => {
                    let token = self.next_token;
                    self.next_token += 1;
                    self.pending += 1;
                    return Ok(CapturedPacket { token, buf, mark });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if self.pending == 0 {
                        self.flush_verdicts();
                        return Err(QueueError::Closed);
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> Result<(), QueueError> {
        self.flush_verdicts();
        Ok(())
    }
}
