//! Exactly-once verdict issuing
//!
//! Every captured packet must receive exactly one verdict: zero stalls
//! the kernel queue forever, two is a transport protocol violation. The
//! controller enforces both sides of that: a second verdict attempt is
//! an error, and a controller dropped without any verdict emits a `Drop`
//! on the way out so the queue can never wedge on a code path that
//! forgot to decide.
//!
//! Rewritten packets go out through [`WireAction::AcceptMangled`]; if
//! re-serialization fails, the packet fails closed (or open, per
//! configuration) and the error is surfaced to the caller for logging.

use crate::error::{PacketError, QueueError};
use crate::packet::PacketView;
use crate::queue::{VerdictSink, WireAction};

pub struct VerdictController<'a, S: VerdictSink> {
    sink: &'a S,
    token: u64,
    fail_open: bool,
    issued: bool,
}

/// Outcome of a payload rewrite attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MangleOutcome {
    /// Rewrite went out; the payload length changed by `delta` bytes.
    Applied { delta: i64 },
    /// Rewrite could not be serialized; the packet was dropped instead.
    FailedClosed,
}

impl<'a, S: VerdictSink> VerdictController<'a, S> {
    pub fn new(sink: &'a S, token: u64, fail_open: bool) -> Self {
        Self {
            sink,
            token,
            fail_open,
            issued: false,
        }
    }

    fn issue(&mut self, action: WireAction) -> Result<(), QueueError> {
        debug_assert!(!self.issued);
        self.issued = true;
        self.sink.send(self.token, action)
    }

    fn ensure_unissued(&self) -> Result<(), PacketError> {
        if self.issued {
            return Err(PacketError::VerdictAlreadyIssued);
        }
        Ok(())
    }

    /// Accept the packet, re-serializing it first if any header or
    /// payload mutation happened. A packet that cannot be re-serialized
    /// follows the fail policy (drop, or accept as captured).
    ///
    /// # Errors
    ///
    /// [`PacketError::VerdictAlreadyIssued`] on a second verdict;
    /// [`PacketError::Serialize`] if the rewrite could not be emitted (a
    /// fallback verdict has been issued by then). Sink failures mean the
    /// transport is gone.
    pub fn accept(&mut self, view: &PacketView) -> Result<(), PacketError> {
        self.ensure_unissued()?;
        if !view.is_dirty() {
            return self.issue(WireAction::Accept).map_err(closed);
        }
        match view.serialize() {
            Ok(buf) => self.issue(WireAction::AcceptMangled(buf)).map_err(closed),
            Err(e) => {
                let fallback = if self.fail_open {
                    WireAction::Accept
                } else {
                    WireAction::Drop
                };
                self.issue(fallback).map_err(closed)?;
                Err(e)
            }
        }
    }

    /// Silently discard the packet.
    ///
    /// # Errors
    ///
    /// See [`VerdictController::accept`].
    pub fn drop_packet(&mut self) -> Result<(), PacketError> {
        self.ensure_unissued()?;
        self.issue(WireAction::Drop).map_err(closed)
    }

    /// Turn the packet into a polite teardown: payload stripped, FIN+ACK
    /// set, SYN cleared. Only TCP can be closed politely; anything else
    /// falls back to a drop, as does a rewrite that cannot be serialized.
    ///
    /// # Errors
    ///
    /// See [`VerdictController::accept`].
    pub fn reject(&mut self, view: &mut PacketView) -> Result<(), PacketError> {
        self.ensure_unissued()?;
        if view.tcp().is_none() {
            return self.issue(WireAction::Drop).map_err(closed);
        }
        view.strip_payload();
        view.set_fin_ack();
        match view.serialize() {
            Ok(buf) => self.issue(WireAction::AcceptMangled(buf)).map_err(closed),
            Err(e) => {
                // A teardown that cannot be built still must not leak
                // the payload, regardless of fail policy.
                self.issue(WireAction::Drop).map_err(closed)?;
                Err(e)
            }
        }
    }

    /// Replace the packet's payload and accept it.
    ///
    /// # Errors
    ///
    /// [`PacketError::VerdictAlreadyIssued`] on a second verdict; sink
    /// failures if the transport is gone. Serialization failure is not
    /// an error here, it is reported as [`MangleOutcome::FailedClosed`].
    pub fn mangle(
        &mut self,
        view: &mut PacketView,
        payload: Vec<u8>,
    ) -> Result<MangleOutcome, PacketError> {
        self.ensure_unissued()?;
        let old_len = view.payload().len() as i64;
        let new_len = payload.len() as i64;
        view.set_payload(payload);
        match view.serialize() {
            Ok(buf) => {
                self.issue(WireAction::AcceptMangled(buf)).map_err(closed)?;
                Ok(MangleOutcome::Applied {
                    delta: new_len - old_len,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "rewrite not serializable, packet dropped");
                self.issue(WireAction::Drop).map_err(closed)?;
                Ok(MangleOutcome::FailedClosed)
            }
        }
    }

    /// Whether a verdict already went out.
    #[must_use]
    pub const fn is_issued(&self) -> bool {
        self.issued
    }
}

impl<S: VerdictSink> Drop for VerdictController<'_, S> {
    fn drop(&mut self) {
        if !self.issued {
            // Backstop: no decision path ran to completion.
            self.issued = true;
            let _ = self.sink.send(self.token, WireAction::Drop);
        }
    }
}

fn closed(e: QueueError) -> PacketError {
    PacketError::Engine(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct RecordingSink(Arc<Mutex<mpsc::Sender<(u64, WireAction)>>>);

    impl VerdictSink for RecordingSink {
        fn send(&self, token: u64, action: WireAction) -> Result<(), QueueError> {
            self.0
                .lock()
                .map_err(|_| QueueError::Closed)?
                .send((token, action))
                .map_err(|_| QueueError::Closed)
        }
    }

    fn sink() -> (RecordingSink, mpsc::Receiver<(u64, WireAction)>) {
        let (tx, rx) = mpsc::channel();
        (RecordingSink(Arc::new(Mutex::new(tx))), rx)
    }

    fn packet(payload: &[u8]) -> PacketView {
        let builder = etherparse::PacketBuilder::ipv4([1, 1, 1, 1], [2, 2, 2, 2], 64)
            .tcp(1000, 2000, 10, 1024);
        let mut raw = Vec::new();
        builder.write(&mut raw, payload).unwrap();
        PacketView::parse(raw, 1).unwrap()
    }

    #[test]
    fn test_clean_accept_passes_original_bytes() {
        let (s, rx) = sink();
        let view = packet(b"data");
        let mut ctl = VerdictController::new(&s, 7, false);
        ctl.accept(&view).unwrap();
        assert_eq!(rx.recv().unwrap(), (7, WireAction::Accept));
    }

    #[test]
    fn test_dirty_accept_reserializes() {
        let (s, rx) = sink();
        let mut view = packet(b"data");
        view.shift_seq(5);
        let mut ctl = VerdictController::new(&s, 0, false);
        ctl.accept(&view).unwrap();
        match rx.recv().unwrap().1 {
            WireAction::AcceptMangled(buf) => {
                let re = PacketView::parse(buf, 1).unwrap();
                assert_eq!(re.tcp().unwrap().sequence_number, 15);
            }
            other => panic!("expected mangled accept, got {other:?}"),
        }
    }

    #[test]
    fn test_second_verdict_rejected() {
        let (s, rx) = sink();
        let view = packet(b"");
        let mut ctl = VerdictController::new(&s, 1, false);
        ctl.accept(&view).unwrap();
        assert!(matches!(
            ctl.drop_packet(),
            Err(PacketError::VerdictAlreadyIssued)
        ));
        // Only the first verdict reached the sink.
        rx.recv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_guard_backstop() {
        let (s, rx) = sink();
        {
            let _ctl = VerdictController::<RecordingSink>::new(&s, 9, false);
            // No verdict issued on any path.
        }
        assert_eq!(rx.recv().unwrap(), (9, WireAction::Drop));
    }

    #[test]
    fn test_reject_strips_and_fins() {
        let (s, rx) = sink();
        let mut view = packet(b"FLAG{leak}");
        let mut ctl = VerdictController::new(&s, 3, false);
        ctl.reject(&mut view).unwrap();
        match rx.recv().unwrap().1 {
            WireAction::AcceptMangled(buf) => {
                let re = PacketView::parse(buf, 1).unwrap();
                assert!(re.payload().is_empty());
                assert!(re.tcp().unwrap().fin);
                assert!(re.tcp().unwrap().ack);
            }
            other => panic!("expected mangled accept, got {other:?}"),
        }
    }

    #[test]
    fn test_mangle_reports_delta() {
        let (s, rx) = sink();
        let mut view = packet(b"0123456789");
        let mut ctl = VerdictController::new(&s, 4, false);
        let outcome = ctl.mangle(&mut view, b"0123".to_vec()).unwrap();
        assert_eq!(outcome, MangleOutcome::Applied { delta: -6 });
        match rx.recv().unwrap().1 {
            WireAction::AcceptMangled(buf) => {
                let re = PacketView::parse(buf, 1).unwrap();
                assert_eq!(re.payload(), b"0123");
            }
            other => panic!("expected mangled accept, got {other:?}"),
        }
    }
}
