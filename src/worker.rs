//! Sharded filter workers
//!
//! One dispatch loop owns the transport and routes every parsed packet
//! to a worker by hashing its flow identity, so all packets of one
//! connection are handled by one thread in arrival order. Worker queues
//! are bounded at the kernel's own queue depth; a full queue blocks the
//! dispatcher rather than reordering or shedding packets.
//!
//! Workers own all per-stream state (reassembly, offsets, blocked flag)
//! and their own decision engine instance, so the hot path takes no
//! locks at all.

use std::io::Write as _;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::engine::{Decision, DecisionEngine, EngineFactory};
use crate::error::{PacketError, QueueError};
use crate::packet::{PacketView, TransportProto};
use crate::queue::{CapturedPacket, Transport, VerdictSink, WireAction};
use crate::stream::{DatagramBlocklist, StreamTable};
use crate::verdict::{MangleOutcome, VerdictController};

/// Per-worker queue capacity. Matches the default kernel nfqueue depth,
/// so the kernel side overflows no earlier than ours would.
const WORKER_QUEUE_DEPTH: usize = 1024;

struct Job {
    token: u64,
    view: PacketView,
}

/// The worker pool plus its dispatch loop.
pub struct FilterPool<S: VerdictSink> {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    sink: S,
}

impl<S: VerdictSink> FilterPool<S> {
    /// Spawn `workers` filter threads, each with its own engine.
    pub fn spawn<F: EngineFactory>(factory: &F, sink: S, workers: usize, fail_open: bool) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = crossbeam_channel::bounded::<Job>(WORKER_QUEUE_DEPTH);
            let engine = factory.build();
            let worker_sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                worker_loop(id, &rx, engine, &worker_sink, fail_open);
            }));
            senders.push(tx);
        }
        Self {
            senders,
            handles,
            sink,
        }
    }

    /// Run the dispatch loop until the transport closes, then drain the
    /// workers and release the transport.
    ///
    /// # Errors
    ///
    /// Propagates fatal transport errors; an orderly close returns `Ok`.
    pub fn run<T: Transport<Sink = S>>(self, mut transport: T) -> Result<(), QueueError> {
        let result = loop {
            match transport.receive() {
                Ok(pkt) => self.dispatch(pkt),
                Err(QueueError::Closed) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        // Closing the channels lets each worker finish its backlog.
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.join();
        }
        if result.is_ok() {
            transport.finish()?;
        }
        info!("filter pool stopped");
        result
    }

    fn dispatch(&self, pkt: CapturedPacket) {
        match PacketView::parse(pkt.buf, pkt.mark) {
            Ok(view) => {
                let shard = view.stream_id().shard(self.senders.len());
                let job = Job {
                    token: pkt.token,
                    view,
                };
                // Blocking send: a saturated worker stalls intake
                // instead of reordering a connection across threads.
                if self.senders[shard].send(job).is_err() {
                    let _ = self.sink.send(pkt.token, WireAction::Drop);
                }
            }
            Err(e) => {
                // A packet we cannot parse is one we cannot inspect; it
                // still gets its verdict so the kernel queue never stalls.
                debug!(error = %e, "unparseable packet dropped");
                let _ = self.sink.send(pkt.token, WireAction::Drop);
            }
        }
    }
}

fn worker_loop<E: DecisionEngine, S: VerdictSink>(
    id: usize,
    rx: &Receiver<Job>,
    mut engine: E,
    sink: &S,
    fail_open: bool,
) {
    let mut streams = StreamTable::new();
    let mut blocks = DatagramBlocklist::new();
    debug!(worker = id, "filter worker started");
    while let Ok(job) = rx.recv() {
        handle_job(job, &mut engine, &mut streams, &mut blocks, sink, fail_open);
    }
    debug!(worker = id, streams = streams.len(), "filter worker stopped");
}

fn handle_job<E: DecisionEngine, S: VerdictSink>(
    job: Job,
    engine: &mut E,
    streams: &mut StreamTable,
    blocks: &mut DatagramBlocklist,
    sink: &S,
    fail_open: bool,
) {
    let mut view = job.view;
    let mut ctl = VerdictController::new(sink, job.token, fail_open);
    match view.proto() {
        TransportProto::Tcp => handle_tcp(&mut view, &mut ctl, engine, streams, fail_open),
        TransportProto::Udp | TransportProto::Raw => {
            handle_datagram(&mut view, &mut ctl, engine, blocks, fail_open);
        }
    }
}

fn handle_tcp<E: DecisionEngine, S: VerdictSink>(
    view: &mut PacketView,
    ctl: &mut VerdictController<'_, S>,
    engine: &mut E,
    streams: &mut StreamTable,
    fail_open: bool,
) {
    let sid = view.stream_id();
    let dir = view.direction();
    let Some(tcp) = view.tcp().cloned() else {
        report(ctl.accept(view));
        return;
    };

    let state = streams.entry(sid);
    // Reassembly runs in the sender's own sequence space, before any
    // wire fixups are applied to the packet.
    let delivery = state.reasm.feed(dir, &tcp, view.payload());
    if delivery.restarted {
        debug!(stream = %sid, "flow restarted, state discarded");
        state.restart();
        engine.forget(&sid);
    }
    state.offsets.apply(view, dir);

    if state.is_blocked() {
        // The stream already matched: no payload crosses in either
        // direction until the connection dies.
        if view.payload().is_empty() {
            report(ctl.accept(view));
        } else if dir.is_client_to_server() {
            report(ctl.reject(view));
        } else {
            // In-flight server data after the block is stripped too,
            // but the FIN only ever goes toward the protected service.
            view.strip_payload();
            report(ctl.accept(view));
        }
    } else {
        let decision = if delivery.data.is_empty() {
            Ok(Decision::Accept)
        } else {
            engine.decide(&sid, dir, view.proto(), &delivery.data)
        };
        match decision {
            Ok(Decision::Accept) => report(ctl.accept(view)),
            Ok(Decision::Reject { matched_by }) => {
                announce_block(&matched_by);
                engine.forget(&sid);
                if dir.is_client_to_server() {
                    report(ctl.reject(view));
                } else {
                    // Matched bytes heading to the client never leave.
                    report(ctl.drop_packet());
                }
                state.blocked = Some(matched_by);
            }
            Ok(Decision::Drop { matched_by }) => {
                announce_block(&matched_by);
                engine.forget(&sid);
                report(ctl.drop_packet());
                state.blocked = Some(matched_by);
            }
            Ok(Decision::Mangle { payload }) => match ctl.mangle(view, payload) {
                Ok(MangleOutcome::Applied { delta }) => {
                    if delta != 0 {
                        state.offsets.record(dir, delta);
                    }
                }
                Ok(MangleOutcome::FailedClosed) => {}
                Err(e) => report(Err(e)),
            },
            Err(e) => {
                warn!(stream = %sid, error = %e, "decision engine failed on packet");
                if fail_open {
                    report(ctl.accept(view));
                } else {
                    report(ctl.drop_packet());
                }
            }
        }
    }

    if state.reasm.is_closed() {
        streams.remove(&sid);
        engine.forget(&sid);
    }
}

fn handle_datagram<E: DecisionEngine, S: VerdictSink>(
    view: &mut PacketView,
    ctl: &mut VerdictController<'_, S>,
    engine: &mut E,
    blocks: &mut DatagramBlocklist,
    fail_open: bool,
) {
    let sid = view.stream_id();
    if blocks.is_blocked(&sid) {
        report(ctl.drop_packet());
        return;
    }

    let decision = if view.payload().is_empty() {
        Ok(Decision::Accept)
    } else {
        engine.decide(&sid, view.direction(), view.proto(), view.payload())
    };
    match decision {
        Ok(Decision::Accept) => report(ctl.accept(view)),
        Ok(Decision::Drop { matched_by } | Decision::Reject { matched_by }) => {
            announce_block(&matched_by);
            blocks.block(sid, matched_by);
            report(ctl.drop_packet());
        }
        Ok(Decision::Mangle { payload }) => {
            // Datagrams have no sequence space; nothing to record.
            if let Err(e) = ctl.mangle(view, payload) {
                report(Err(e));
            }
        }
        Err(e) => {
            warn!(stream = %sid, error = %e, "decision engine failed on packet");
            if fail_open {
                report(ctl.accept(view));
            } else {
                report(ctl.drop_packet());
            }
        }
    }
}

/// Control-channel notification that a rule fired.
fn announce_block(token: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "BLOCKED {token}");
    let _ = out.flush();
}

fn report(result: Result<(), PacketError>) {
    if let Err(e) = result {
        warn!(error = %e, "verdict path failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchMode;
    use crate::engine::{RegexEngineFactory, RulesetHandle};
    use crate::queue::{memory_pair, MemoryHarness};
    use std::sync::Arc;

    fn run_pipeline(
        rules: &str,
        workers: usize,
        inject: impl FnOnce(&MemoryHarness),
    ) -> Vec<(u64, WireAction)> {
        let handle = Arc::new(RulesetHandle::new());
        handle.reload(rules).unwrap();
        let factory = RegexEngineFactory::new(handle, MatchMode::Stream);
        let (transport, harness) = memory_pair(0);
        let pool = FilterPool::spawn(&factory, transport.sink(), workers, false);
        inject(&harness);
        let outcomes = harness.close();
        pool.run(transport).unwrap();
        let mut collected: Vec<_> = outcomes.try_iter().collect();
        collected.sort_by_key(|(token, _)| *token);
        collected
    }

    fn tcp_packet(payload: &[u8], seq: u32) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 80, seq, 1024);
        let mut raw = Vec::new();
        builder.write(&mut raw, payload).unwrap();
        raw
    }

    #[test]
    fn test_clean_traffic_accepted() {
        let outcomes = run_pipeline(&format!("1C{}", hex::encode("evil")), 2, |h| {
            h.inject(tcp_packet(b"hello", 1), 1);
            h.inject(tcp_packet(b"world", 6), 1);
        });
        assert_eq!(outcomes.len(), 2);
        for (_, action) in outcomes {
            assert_eq!(action, WireAction::Accept);
        }
    }

    #[test]
    fn test_matching_packet_rejected_with_fin() {
        let outcomes = run_pipeline(&format!("1C{}", hex::encode("evil")), 1, |h| {
            h.inject(tcp_packet(b"quite evil bytes", 1), 1);
        });
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0].1 {
            WireAction::AcceptMangled(buf) => {
                let view = PacketView::parse(buf.clone(), 1).unwrap();
                assert!(view.payload().is_empty());
                assert!(view.tcp().unwrap().fin);
            }
            other => panic!("expected stripped teardown, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_packet_dropped() {
        let outcomes = run_pipeline("", 1, |h| {
            h.inject(vec![0xff, 0x00, 0x01], 1);
        });
        assert_eq!(outcomes, vec![(0, WireAction::Drop)]);
    }
}
