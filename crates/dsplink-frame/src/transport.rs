use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dsplink_ring::{Direction, Frame, FrameClass, RingPair, SubmitError};
use tracing::{debug, trace, warn};

use crate::codec::classify;

/// Receives the frames a [`FrameTransport::poll`] drains.
pub trait FrameSink {
    /// An outbound frame completed transmission and is back with the host.
    fn on_transmitted(&mut self, frame: Frame);
    /// An inbound control frame.
    fn on_control(&mut self, frame: Frame);
    /// An inbound payload frame.
    fn on_payload(&mut self, frame: Frame);
}

/// Passive mirror of control traffic (packet capture).
pub trait CaptureTap: Send + Sync {
    fn capture(&self, direction: Direction, bytes: &[u8]);
}

/// Counters kept by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransportStats {
    /// Frames handed to [`FrameTransport::send`].
    pub sent: u64,
    /// Sends that hit a full ring and were queued.
    pub queued: u64,
    /// Outbound frames the device completed.
    pub transmitted: u64,
    pub received_control: u64,
    pub received_payload: u64,
    /// Inbound frames that could not be classified.
    pub malformed: u64,
    /// Frames currently waiting in the overflow queue.
    pub pending: usize,
}

/// What one [`FrameTransport::poll`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub transmitted: usize,
    pub control: usize,
    pub payload: usize,
    pub malformed: usize,
    /// Queued sends moved onto the ring.
    pub flushed: usize,
}

impl PollSummary {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    queued: AtomicU64,
    transmitted: AtomicU64,
    received_control: AtomicU64,
    received_payload: AtomicU64,
    malformed: AtomicU64,
}

/// Send/receive over the two rings of a device.
///
/// Sends that find the submit ring full are queued in FIFO order and moved
/// onto the ring as slots free up. Every inbound frame removed from the
/// receive ring is replaced by a fresh empty buffer.
pub struct FrameTransport {
    rings: RingPair,
    pending: Mutex<VecDeque<Frame>>,
    capture: Option<Arc<dyn CaptureTap>>,
    counters: Counters,
}

impl FrameTransport {
    pub fn new(rings: RingPair) -> Self {
        Self {
            rings,
            pending: Mutex::new(VecDeque::new()),
            capture: None,
            counters: Counters::default(),
        }
    }

    /// Attach a capture tap for control frames.
    pub fn with_capture(mut self, tap: Arc<dyn CaptureTap>) -> Self {
        self.capture = Some(tap);
        self
    }

    pub fn rings(&self) -> &RingPair {
        &self.rings
    }

    /// Top up the receive ring with empty buffers. Returns buffers posted.
    pub fn prime(&self) -> usize {
        let mut posted = 0;
        while !self.rings.rx.is_full() {
            if let Err(err) = self.rings.rx.submit(Frame::empty_rx()) {
                debug!(error = %err, "receive ring refused buffer");
                break;
            }
            posted += 1;
        }
        posted
    }

    /// Send a frame. Never blocks and never loses the frame.
    pub fn send(&self, frame: Frame) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        if frame.tag().class == FrameClass::Control {
            self.mirror(Direction::Tx, &frame);
        }

        let mut pending = self.pending();
        if !pending.is_empty() {
            trace!(frame = %frame.id(), depth = pending.len(), "queue behind pending sends");
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            pending.push_back(frame);
            return;
        }

        match self.rings.tx.submit(frame) {
            Ok(()) => {}
            Err(SubmitError::Busy(frame)) => {
                debug!(frame = %frame.id(), "submit ring full, queueing");
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                pending.push_back(frame);
            }
            Err(SubmitError::AlreadySubmitted(frame)) => {
                warn!(frame = %frame.id(), "frame already on the submit ring, dropping duplicate");
            }
        }
    }

    /// Drain completed outbound and inbound frames into `sink`.
    pub fn poll(&self, sink: &mut dyn FrameSink) -> PollSummary {
        let mut summary = PollSummary::default();

        while let Some(frame) = self.rings.tx.retrieve() {
            summary.transmitted += 1;
            self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
            sink.on_transmitted(frame);
        }

        summary.flushed = self.flush_pending();

        while let Some(mut frame) = self.rings.rx.retrieve() {
            self.replenish();

            let (class, channel) = match classify(frame.as_bytes()) {
                Ok(found) => found,
                Err(err) => {
                    debug!(error = %err, len = frame.len(), "dropping unclassifiable frame");
                    summary.malformed += 1;
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let tag = frame.tag_mut();
            tag.class = class;
            tag.channel = Some(channel);

            match class {
                FrameClass::Control => {
                    summary.control += 1;
                    self.counters.received_control.fetch_add(1, Ordering::Relaxed);
                    self.mirror(Direction::Rx, &frame);
                    sink.on_control(frame);
                }
                _ => {
                    summary.payload += 1;
                    self.counters.received_payload.fetch_add(1, Ordering::Relaxed);
                    sink.on_payload(frame);
                }
            }
        }

        summary
    }

    /// Frames waiting for a free submit slot.
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            transmitted: self.counters.transmitted.load(Ordering::Relaxed),
            received_control: self.counters.received_control.load(Ordering::Relaxed),
            received_payload: self.counters.received_payload.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            pending: self.pending_len(),
        }
    }

    /// Discard everything in flight (board reset). Returns frames dropped.
    pub fn reset(&self) -> usize {
        let mut pending = self.pending();
        let dropped = pending.len() + self.rings.tx.drain().len() + self.rings.rx.drain().len();
        pending.clear();
        dropped
    }

    fn flush_pending(&self) -> usize {
        let mut pending = self.pending();
        let mut flushed = 0;
        while let Some(frame) = pending.pop_front() {
            match self.rings.tx.submit(frame) {
                Ok(()) => flushed += 1,
                Err(SubmitError::Busy(frame)) => {
                    pending.push_front(frame);
                    break;
                }
                Err(SubmitError::AlreadySubmitted(frame)) => {
                    warn!(frame = %frame.id(), "queued frame already on the submit ring, dropping");
                }
            }
        }
        if flushed > 0 {
            trace!(flushed, remaining = pending.len(), "flushed pending sends");
        }
        flushed
    }

    fn replenish(&self) {
        if let Err(err) = self.rings.rx.submit(Frame::empty_rx()) {
            warn!(error = %err, "failed to replenish receive ring");
        }
    }

    fn mirror(&self, direction: Direction, frame: &Frame) {
        if let Some(tap) = &self.capture {
            tap.capture(direction, frame.as_bytes());
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTransport")
            .field("rings", &self.rings)
            .field("pending", &self.pending_len())
            .field("capture", &self.capture.is_some())
            .finish()
    }
}
