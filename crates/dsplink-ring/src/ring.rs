use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::doorbell::Doorbell;
use crate::error::{Result, RingError, SubmitError};
use crate::frame::{Frame, FrameId};

/// Default number of slots per ring.
pub const DEFAULT_RING_CAPACITY: usize = 16;

/// Slot counts for the two rings of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RingConfig {
    /// Submit ring (host → device) capacity. Power of two.
    pub tx_capacity: usize,
    /// Receive ring (device → host) capacity. Power of two.
    pub rx_capacity: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            tx_capacity: DEFAULT_RING_CAPACITY,
            rx_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

/// Counters kept by a ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub submitted: u64,
    pub completed: u64,
    pub retrieved: u64,
    /// Submissions rejected because the ring was full.
    pub busy: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Host,
    Device,
}

struct Slot {
    frame: Option<Frame>,
    owner: Owner,
    /// Completion length written by the device.
    result: usize,
}

impl Slot {
    fn empty() -> Self {
        Self {
            frame: None,
            owner: Owner::Host,
            result: 0,
        }
    }
}

struct RingState {
    slots: Vec<Slot>,
    /// Next slot the host retrieves.
    head: usize,
    /// Next slot the host submits into.
    tail: usize,
    /// Next slot the device completes. Always between head and tail.
    cursor: usize,
    occupied: usize,
    stats: RingStats,
}

/// Fixed-capacity circular buffer of frame slots shared with the device.
///
/// Host side: [`submit`](Self::submit) and [`retrieve`](Self::retrieve).
/// Device side: [`complete_next`](Self::complete_next). Slots are handed
/// over in order; a slot is device-owned from submit until completion.
pub struct FrameRing {
    name: &'static str,
    mask: usize,
    state: Mutex<RingState>,
    device_bell: Mutex<Option<Doorbell>>,
    host_bell: Mutex<Option<Doorbell>>,
}

impl FrameRing {
    /// Create a ring with `capacity` slots.
    pub fn new(name: &'static str, capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity { capacity });
        }
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        Ok(Self {
            name,
            mask: capacity - 1,
            state: Mutex::new(RingState {
                slots,
                head: 0,
                tail: 0,
                cursor: 0,
                occupied: 0,
                stats: RingStats::default(),
            }),
            device_bell: Mutex::new(None),
            host_bell: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Doorbell rung after every successful submit.
    pub fn connect_device(&self, bell: Doorbell) {
        *self.device_bell.lock().unwrap_or_else(PoisonError::into_inner) = Some(bell);
    }

    /// Doorbell rung after every device completion.
    pub fn connect_host(&self, bell: Doorbell) {
        *self.host_bell.lock().unwrap_or_else(PoisonError::into_inner) = Some(bell);
    }

    /// Hand a frame to the device. Never blocks.
    pub fn submit(&self, frame: Frame) -> std::result::Result<(), SubmitError> {
        {
            let mut state = self.lock();
            if state.holds(frame.id()) {
                return Err(SubmitError::AlreadySubmitted(frame));
            }
            let tail = state.tail;
            if state.slots[tail].frame.is_some() {
                state.stats.busy += 1;
                return Err(SubmitError::Busy(frame));
            }
            trace!(ring = self.name, slot = tail, frame = %frame.id(), "submit");
            state.slots[tail] = Slot {
                frame: Some(frame),
                owner: Owner::Device,
                result: 0,
            };
            state.tail = (tail + 1) & self.mask;
            state.occupied += 1;
            state.stats.submitted += 1;
        }
        ring(&self.device_bell);
        Ok(())
    }

    /// Take the next completed frame in head order.
    pub fn retrieve(&self) -> Option<Frame> {
        let mut state = self.lock();
        let head = state.head;
        let slot = &mut state.slots[head];
        if slot.owner == Owner::Device {
            return None;
        }
        let mut frame = slot.frame.take()?;
        frame.truncate(slot.result);
        slot.result = 0;

        state.head = (head + 1) & self.mask;
        state.occupied -= 1;
        state.stats.retrieved += 1;
        trace!(ring = self.name, slot = head, frame = %frame.id(), "retrieve");
        Some(frame)
    }

    /// Device side: process the next device-owned slot.
    ///
    /// `complete` returns the completion length, or `None` to leave the slot
    /// with the device (link busy). Returns true when a slot was completed.
    pub fn complete_next<F>(&self, complete: F) -> bool
    where
        F: FnOnce(&mut Frame) -> Option<usize>,
    {
        {
            let mut state = self.lock();
            let cursor = state.cursor;
            let slot = &mut state.slots[cursor];
            if slot.owner != Owner::Device {
                return false;
            }
            let Some(frame) = slot.frame.as_mut() else {
                return false;
            };
            let Some(len) = complete(frame) else {
                return false;
            };
            slot.result = len.min(frame.len());
            slot.owner = Owner::Host;

            state.cursor = (cursor + 1) & self.mask;
            state.stats.completed += 1;
        }
        ring(&self.host_bell);
        true
    }

    /// Slots currently owned by the device.
    pub fn device_owned(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.owner == Owner::Device)
            .count()
    }

    /// Slots holding a frame (device-owned or completed but not retrieved).
    pub fn occupied(&self) -> usize {
        self.lock().occupied
    }

    pub fn is_full(&self) -> bool {
        self.occupied() == self.capacity()
    }

    /// True when a frame with this id sits in an unretrieved slot.
    pub fn contains(&self, id: FrameId) -> bool {
        self.lock().holds(id)
    }

    pub fn stats(&self) -> RingStats {
        self.lock().stats
    }

    /// Reclaim every frame and rewind the ring (board reset).
    pub fn drain(&self) -> Vec<Frame> {
        let mut state = self.lock();
        let frames = state
            .slots
            .iter_mut()
            .filter_map(|slot| {
                let frame = slot.frame.take();
                *slot = Slot::empty();
                frame
            })
            .collect();
        state.head = 0;
        state.tail = 0;
        state.cursor = 0;
        state.occupied = 0;
        frames
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RingState {
    fn holds(&self, id: FrameId) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.frame.as_ref().is_some_and(|f| f.id() == id))
    }
}

impl fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("FrameRing")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("head", &state.head)
            .field("tail", &state.tail)
            .field("occupied", &state.occupied)
            .finish()
    }
}

fn ring(bell: &Mutex<Option<Doorbell>>) {
    if let Some(bell) = bell.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
        bell.ring();
    }
}

/// The submit and receive rings of one device.
#[derive(Debug, Clone)]
pub struct RingPair {
    pub tx: Arc<FrameRing>,
    pub rx: Arc<FrameRing>,
}

impl RingPair {
    pub fn new(config: &RingConfig) -> Result<Self> {
        Ok(Self {
            tx: Arc::new(FrameRing::new("tx", config.tx_capacity)?),
            rx: Arc::new(FrameRing::new("rx", config.rx_capacity)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::doorbell::{doorbell, Wake};

    fn frame(bytes: &[u8]) -> Frame {
        Frame::outbound(BytesMut::from(bytes)).unwrap()
    }

    fn transmit(frame: &mut Frame) -> Option<usize> {
        Some(frame.len())
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            FrameRing::new("tx", 12),
            Err(RingError::InvalidCapacity { capacity: 12 })
        ));
        assert!(FrameRing::new("tx", 0).is_err());
        assert!(FrameRing::new("tx", 8).is_ok());
    }

    #[test]
    fn submit_until_busy() {
        let ring = FrameRing::new("tx", 4).unwrap();
        for i in 0..4u8 {
            ring.submit(frame(&[i])).unwrap();
        }
        assert!(ring.is_full());
        let err = ring.submit(frame(b"x")).unwrap_err();
        assert!(err.is_busy());
        assert_eq!(err.into_frame().as_bytes(), b"x");
        assert_eq!(ring.stats().busy, 1);
    }

    #[test]
    fn retrieve_waits_for_device() {
        let ring = FrameRing::new("tx", 4).unwrap();
        ring.submit(frame(b"one")).unwrap();
        assert!(ring.retrieve().is_none());

        assert!(ring.complete_next(transmit));
        let done = ring.retrieve().unwrap();
        assert_eq!(done.as_bytes(), b"one");
        assert!(ring.retrieve().is_none());
        assert_eq!(ring.occupied(), 0);
    }

    #[test]
    fn completion_preserves_order() {
        let ring = FrameRing::new("tx", 4).unwrap();
        ring.submit(frame(b"a")).unwrap();
        ring.submit(frame(b"b")).unwrap();
        ring.submit(frame(b"c")).unwrap();
        while ring.complete_next(transmit) {}

        let order: Vec<_> = std::iter::from_fn(|| ring.retrieve())
            .map(|f| f.as_bytes().to_vec())
            .collect();
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn duplicate_submission_detected() {
        let ring = FrameRing::new("tx", 4).unwrap();
        let original = frame(b"dup");
        let copy = original.clone();
        ring.submit(original).unwrap();
        let err = ring.submit(copy).unwrap_err();
        assert!(matches!(err, SubmitError::AlreadySubmitted(_)));

        ring.complete_next(transmit);
        let back = ring.retrieve().unwrap();
        // Once retrieved the frame may go out again.
        ring.submit(back).unwrap();
    }

    #[test]
    fn device_may_leave_slot_pending() {
        let ring = FrameRing::new("tx", 2).unwrap();
        ring.submit(frame(b"x")).unwrap();
        assert!(!ring.complete_next(|_| None));
        assert_eq!(ring.device_owned(), 1);
        assert!(ring.complete_next(transmit));
        assert_eq!(ring.device_owned(), 0);
    }

    #[test]
    fn receive_completion_sets_length() {
        let ring = FrameRing::new("rx", 2).unwrap();
        ring.submit(Frame::empty_rx()).unwrap();
        ring.complete_next(|buf| {
            buf.fill(b"inbound").ok()?;
            Some(3)
        });
        let got = ring.retrieve().unwrap();
        assert_eq!(got.as_bytes(), b"inb");
    }

    #[test]
    fn device_owned_never_exceeds_capacity() {
        let ring = FrameRing::new("tx", 8).unwrap();
        let mut seed = 0x2545_f491_u32;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 3 {
                0 => {
                    let _ = ring.submit(frame(&seed.to_le_bytes()));
                }
                1 => {
                    ring.complete_next(transmit);
                }
                _ => {
                    ring.retrieve();
                }
            }
            assert!(ring.device_owned() <= ring.capacity());
            assert!(ring.occupied() <= ring.capacity());
        }
    }

    #[test]
    fn doorbells_ring_on_both_sides() {
        let ring = FrameRing::new("tx", 2).unwrap();
        let (to_device, device_wait) = doorbell();
        let (to_host, host_wait) = doorbell();
        ring.connect_device(to_device);
        ring.connect_host(to_host);

        ring.submit(frame(b"x")).unwrap();
        assert_eq!(device_wait.wait(std::time::Duration::ZERO), Wake::Rung);
        ring.complete_next(transmit);
        assert_eq!(host_wait.wait(std::time::Duration::ZERO), Wake::Rung);
    }

    #[test]
    fn drain_reclaims_frames() {
        let ring = FrameRing::new("rx", 4).unwrap();
        ring.submit(Frame::empty_rx()).unwrap();
        ring.submit(Frame::empty_rx()).unwrap();
        let frames = ring.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(ring.occupied(), 0);
        assert_eq!(ring.device_owned(), 0);
    }

    #[test]
    fn ring_pair_from_config() {
        let pair = RingPair::new(&RingConfig::default()).unwrap();
        assert_eq!(pair.tx.capacity(), DEFAULT_RING_CAPACITY);
        assert_eq!(pair.rx.name(), "rx");
    }
}
