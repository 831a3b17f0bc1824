//! NFQUEUE-backed transport
//!
//! The netlink socket is not shareable: `recv` and `verdict` both need
//! exclusive access. The transport therefore owns the [`nfq::Queue`]
//! outright, keeps every un-verdicted [`nfq::Message`] in flight, and
//! runs the socket in non-blocking mode so verdicts queued by workers
//! get applied between receives.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use nfq::{Queue, Verdict};
use tracing::{debug, info, warn};

use super::{CapturedPacket, ChannelVerdictSink, Transport, WireAction};
use crate::config::Config;
use crate::error::QueueError;

/// How many queue numbers past the configured base are probed before
/// giving up.
const QUEUE_SCAN_RANGE: u16 = 64;

/// Socket idle backoff while no packets and no verdicts are pending.
const IDLE_WAIT: Duration = Duration::from_micros(150);

pub struct NfqTransport {
    queue: Queue,
    queue_num: u16,
    inflight: HashMap<u64, nfq::Message>,
    next_token: u64,
    verdict_tx: Sender<(u64, WireAction)>,
    verdict_rx: Receiver<(u64, WireAction)>,
    shutdown: Arc<AtomicBool>,
}

impl NfqTransport {
    /// Bind the first free queue number starting at `config.queue_base`.
    ///
    /// The `shutdown` flag turns the blocking receive loop into an
    /// orderly [`QueueError::Closed`] once set.
    ///
    /// # Errors
    ///
    /// [`QueueError::Open`] if the netlink socket cannot be created,
    /// [`QueueError::NoFreeQueue`] if the whole scan range is taken.
    pub fn open(config: &Config, shutdown: Arc<AtomicBool>) -> Result<Self, QueueError> {
        let start = config.queue_base;
        let end = start.saturating_add(QUEUE_SCAN_RANGE);
        for queue_num in start..end {
            let mut queue = Queue::open().map_err(|e| QueueError::Open(e.to_string()))?;
            if queue.bind(queue_num).is_err() {
                debug!(queue_num, "queue number taken, probing next");
                continue;
            }
            queue
                .set_fail_open(queue_num, config.fail_open)
                .map_err(|e| QueueError::Bind {
                    queue_num,
                    reason: e.to_string(),
                })?;
            queue.set_nonblocking(true);
            info!(queue_num, fail_open = config.fail_open, "nfqueue bound");
            let (verdict_tx, verdict_rx) = crossbeam_channel::unbounded();
            return Ok(Self {
                queue,
                queue_num,
                inflight: HashMap::new(),
                next_token: 0,
                verdict_tx,
                verdict_rx,
                shutdown,
            });
        }
        Err(QueueError::NoFreeQueue { start, end })
    }

    /// Apply every verdict workers have queued since the last call.
    fn flush_verdicts(&mut self) -> Result<(), QueueError> {
        while let Ok((token, action)) = self.verdict_rx.try_recv() {
            let Some(mut msg) = self.inflight.remove(&token) else {
                // Exactly-once is enforced upstream; a stray token here
                // means a bug, not something we can act on.
                warn!(token, "verdict for unknown packet token");
                continue;
            };
            match action {
                WireAction::Accept => msg.set_verdict(Verdict::Accept),
                WireAction::Drop => msg.set_verdict(Verdict::Drop),
                WireAction::AcceptMangled(buf) => {
                    msg.set_payload(buf);
                    msg.set_verdict(Verdict::Accept);
                }
            }
            self.queue
                .verdict(msg)
                .map_err(|e| QueueError::Verdict(e.to_string()))?;
        }
        Ok(())
    }
}

impl Transport for NfqTransport {
    type Sink = ChannelVerdictSink;

    fn queue_num(&self) -> u16 {
        self.queue_num
    }

    fn sink(&self) -> ChannelVerdictSink {
        ChannelVerdictSink::new(self.verdict_tx.clone())
    }

    fn receive(&mut self) -> Result<CapturedPacket, QueueError> {
        loop {
            self.flush_verdicts()?;
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(QueueError::Closed);
            }
            match self.queue.recv() {
                Ok(mut msg) => {
                    let token = self.next_token;
                    self.next_token += 1;
                    let buf = msg.get_payload().to_vec();
                    let mark = msg.get_nfmark();
                    self.inflight.insert(token, msg);
                    return Ok(CapturedPacket { token, buf, mark });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(IDLE_WAIT);
                }
                Err(e) => return Err(QueueError::Recv(e.to_string())),
            }
        }
    }

    fn finish(&mut self) -> Result<(), QueueError> {
        // Give workers a moment to verdict what they already hold.
        for _ in 0..100 {
            self.flush_verdicts()?;
            if self.inflight.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        // Whatever is left gets dropped rather than stalling the kernel.
        let leftover: Vec<u64> = self.inflight.keys().copied().collect();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "dropping un-verdicted packets at shutdown");
        }
        for token in leftover {
            if let Some(mut msg) = self.inflight.remove(&token) {
                msg.set_verdict(Verdict::Drop);
                self.queue
                    .verdict(msg)
                    .map_err(|e| QueueError::Verdict(e.to_string()))?;
            }
        }
        self.queue
            .unbind(self.queue_num)
            .map_err(|e| QueueError::Verdict(e.to_string()))?;
        Ok(())
    }
}
