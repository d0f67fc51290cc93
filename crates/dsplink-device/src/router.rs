//! Payload frames between consumers and device channels.
//!
//! Each open logical channel writes to one device channel and reads from its
//! peer. Inbound payload is routed by device channel number to whichever
//! logical channel currently owns that number; anything else is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dsplink_frame::{decode_payload, encode_payload, FrameTransport, PayloadHeader, Route, LINK_HEADER_SIZE, PAYLOAD_HEADER_SIZE};
use dsplink_ring::{Frame, FrameClass};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelHandle, ChannelId};
use crate::config::RouterConfig;
use crate::error::{DeviceError, Result};
use crate::fault::FaultSeverity;
use crate::format::CodecFormat;

/// How [`PayloadRouter::read`] waits when nothing is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    NonBlocking,
    Blocking,
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Queued,
    /// Flow control: too many samples already in flight on this channel.
    Dropped,
}

/// One received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub sequence: u16,
    pub timestamp: u32,
    pub format: Option<CodecFormat>,
    pub data: Bytes,
}

/// Device channels and formats of an open logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Device channel written to.
    pub tx: u16,
    /// Device channel read from.
    pub rx: u16,
    pub src: CodecFormat,
    pub dst: CodecFormat,
    pub generation: u32,
}

/// Why a channel's queue was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Released,
    Faulted,
}

struct QueueState {
    binding: Option<Binding>,
    closed: CloseReason,
    frames: VecDeque<Payload>,
    in_flight: u32,
    tx_sequence: u16,
    tx_timestamp: u32,
}

impl QueueState {
    fn binding_for(&self, handle: &ChannelHandle) -> Result<Binding> {
        match self.binding {
            Some(binding) if binding.generation == handle.generation => Ok(binding),
            _ => Err(match self.closed {
                CloseReason::Faulted => DeviceError::DeviceFault(FaultSeverity::Fatal),
                CloseReason::Released => DeviceError::InvalidChannel(handle.channel),
            }),
        }
    }
}

struct ChannelQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl ChannelQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                binding: None,
                closed: CloseReason::Released,
                frames: VecDeque::new(),
                in_flight: 0,
                tx_sequence: 0,
                tx_timestamp: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    throttled: AtomicU64,
    delivered: AtomicU64,
    overflowed: AtomicU64,
    unrouted: AtomicU64,
    malformed: AtomicU64,
}

/// Counters kept by the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub written: u64,
    /// Writes dropped by flow control.
    pub throttled: u64,
    pub delivered: u64,
    /// Queued frames discarded because a reader fell behind.
    pub overflowed: u64,
    /// Inbound frames for a device channel nobody has open.
    pub unrouted: u64,
    pub malformed: u64,
}

pub struct PayloadRouter {
    transport: Arc<FrameTransport>,
    route: Route,
    config: RouterConfig,
    queues: Vec<ChannelQueue>,
    routes: RwLock<HashMap<u16, ChannelId>>,
    counters: Counters,
}

impl PayloadRouter {
    pub fn new(transport: Arc<FrameTransport>, route: Route, config: RouterConfig, channels: usize) -> Self {
        Self {
            transport,
            route,
            config,
            queues: (0..channels).map(|_| ChannelQueue::new()).collect(),
            routes: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Start routing for an opened channel.
    pub fn bind(&self, channel: ChannelId, binding: Binding) {
        let Some(queue) = self.queue(channel) else {
            return;
        };
        {
            let mut state = queue.lock();
            state.binding = Some(binding);
            state.frames.clear();
            state.in_flight = 0;
            state.tx_sequence = 0;
            state.tx_timestamp = 0;
        }
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(binding.rx, channel);
        debug!(%channel, tx = binding.tx, rx = binding.rx, "route installed");
    }

    /// Stop routing for a closed channel and wake its readers.
    pub fn unbind(&self, channel: ChannelId) {
        self.close(channel, CloseReason::Released);
    }

    /// Close every channel.
    pub fn close_all(&self, reason: CloseReason) {
        for index in 0..self.queues.len() {
            if let Ok(index) = u16::try_from(index) {
                self.close(ChannelId::from_index(index), reason);
            }
        }
    }

    fn close(&self, channel: ChannelId, reason: CloseReason) {
        let Some(queue) = self.queue(channel) else {
            return;
        };
        let binding = {
            let mut state = queue.lock();
            state.closed = reason;
            state.frames.clear();
            state.binding.take()
        };
        queue.ready.notify_all();

        if let Some(binding) = binding {
            let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
            if routes.get(&binding.rx) == Some(&channel) {
                routes.remove(&binding.rx);
            }
            debug!(%channel, rx = binding.rx, ?reason, "route removed");
        }
    }

    /// Wrap `data` in a payload frame and send it on the channel's device channel.
    pub fn enqueue_outbound(&self, handle: &ChannelHandle, data: &[u8]) -> Result<WriteOutcome> {
        let queue = self.queue(handle.channel).ok_or(DeviceError::InvalidChannel(handle.channel))?;
        let frame = {
            let mut state = queue.lock();
            let binding = state.binding_for(handle)?;
            let samples = binding.src.samples(data.len());
            if state.in_flight.saturating_add(samples) > self.config.max_samples_in_flight {
                self.counters.throttled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %handle.channel,
                    in_flight = state.in_flight,
                    samples,
                    "flow control, dropping write"
                );
                return Ok(WriteOutcome::Dropped);
            }

            let header = PayloadHeader {
                channel: binding.tx,
                sequence: state.tx_sequence,
                timestamp: state.tx_timestamp,
                format: binding.src.wire_code(),
                flags: 0,
            };
            let mut buf = BytesMut::with_capacity(LINK_HEADER_SIZE + PAYLOAD_HEADER_SIZE + data.len());
            encode_payload(self.route, &header, data, &mut buf)?;
            let mut frame = Frame::outbound(buf)?;
            let tag = frame.tag_mut();
            tag.class = FrameClass::Payload;
            tag.channel = Some(binding.tx);

            state.tx_sequence = state.tx_sequence.wrapping_add(1);
            state.tx_timestamp = state.tx_timestamp.wrapping_add(samples);
            state.in_flight += samples;
            trace!(channel = %handle.channel, seq = header.sequence, len = data.len(), "payload queued");
            frame
        };
        self.counters.written.fetch_add(1, Ordering::Relaxed);
        self.transport.send(frame);
        Ok(WriteOutcome::Queued)
    }

    /// An inbound payload frame from the transport.
    pub fn on_payload_frame(&self, frame: Frame) {
        let (header, len) = match decode_payload(frame.as_bytes()) {
            Ok((header, data)) => (header, data.len()),
            Err(err) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "dropping malformed payload frame");
                return;
            }
        };
        let channel = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&header.channel)
            .copied();
        let Some(queue) = channel.and_then(|c| self.queue(c)) else {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            trace!(device_channel = header.channel, "no route for payload");
            return;
        };

        {
            let mut state = queue.lock();
            let Some(binding) = state.binding.filter(|b| b.rx == header.channel) else {
                self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
                return;
            };
            state.in_flight = state.in_flight.saturating_sub(binding.dst.samples(len));
            if state.frames.len() >= self.config.max_queued_frames {
                state.frames.pop_front();
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                warn!(device_channel = header.channel, "reader behind, dropping oldest frame");
            }
            let bytes = frame.into_bytes();
            let data = bytes.slice(bytes.len() - len..);
            state.frames.push_back(Payload {
                sequence: header.sequence,
                timestamp: header.timestamp,
                format: CodecFormat::from_wire(header.format),
                data,
            });
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        queue.ready.notify_all();
    }

    /// Take the next received frame.
    pub fn read(&self, handle: &ChannelHandle, mode: ReadMode) -> Result<Payload> {
        let queue = self.queue(handle.channel).ok_or(DeviceError::InvalidChannel(handle.channel))?;
        let deadline = match mode {
            ReadMode::Timeout(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        let mut state = queue.lock();
        loop {
            state.binding_for(handle)?;
            if let Some(payload) = state.frames.pop_front() {
                return Ok(payload);
            }
            state = match (mode, deadline) {
                (ReadMode::NonBlocking, _) => return Err(DeviceError::WouldBlock),
                (ReadMode::Timeout(limit), Some(deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(DeviceError::ReadTimeout(limit));
                    }
                    queue
                        .ready
                        .wait_timeout(state, remaining)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                _ => queue
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Copy the next received frame into `buf`. A frame larger than `buf`
    /// stays queued.
    pub fn read_into(&self, handle: &ChannelHandle, buf: &mut [u8], mode: ReadMode) -> Result<usize> {
        let queue = self.queue(handle.channel).ok_or(DeviceError::InvalidChannel(handle.channel))?;
        if let Some(needed) = queue.lock().frames.front().map(|p| p.data.len()) {
            if needed > buf.len() {
                return Err(DeviceError::BufferTooSmall {
                    needed,
                    got: buf.len(),
                });
            }
        }

        let payload = self.read(handle, mode)?;
        let len = payload.data.len();
        if len > buf.len() {
            // Arrived between the check and the read; put it back.
            queue.lock().frames.push_front(payload);
            return Err(DeviceError::BufferTooSmall {
                needed: len,
                got: buf.len(),
            });
        }
        buf[..len].copy_from_slice(&payload.data);
        Ok(len)
    }

    /// Frames waiting to be read on `channel`.
    pub fn queued(&self, channel: ChannelId) -> usize {
        self.queue(channel).map_or(0, |q| q.lock().frames.len())
    }

    /// Samples written on `channel` and not yet returned.
    pub fn in_flight(&self, channel: ChannelId) -> u32 {
        self.queue(channel).map_or(0, |q| q.lock().in_flight)
    }

    pub fn stats(&self) -> RouterStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RouterStats {
            written: load(&self.counters.written),
            throttled: load(&self.counters.throttled),
            delivered: load(&self.counters.delivered),
            overflowed: load(&self.counters.overflowed),
            unrouted: load(&self.counters.unrouted),
            malformed: load(&self.counters.malformed),
        }
    }

    fn queue(&self, channel: ChannelId) -> Option<&ChannelQueue> {
        self.queues.get(usize::from(channel.index()))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use dsplink_frame::LinkAddrs;
    use dsplink_ring::{RingConfig, RingPair};

    use super::*;
    use crate::channel::ChannelDirection;

    const ENC0: ChannelId = ChannelId::new(0, ChannelDirection::Encoder);

    fn router(config: RouterConfig) -> Arc<PayloadRouter> {
        let rings = RingPair::new(&RingConfig {
            tx_capacity: 4,
            rx_capacity: 4,
        })
        .unwrap();
        let transport = Arc::new(FrameTransport::new(rings));
        Arc::new(PayloadRouter::new(transport, LinkAddrs::default().to_device(), config, 4))
    }

    fn open(router: &PayloadRouter) -> ChannelHandle {
        router.bind(
            ENC0,
            Binding {
                tx: 10,
                rx: 11,
                src: CodecFormat::Ulaw,
                dst: CodecFormat::G729a,
                generation: 1,
            },
        );
        ChannelHandle {
            channel: ENC0,
            generation: 1,
        }
    }

    fn inbound(channel: u16, sequence: u16, data: &[u8]) -> Frame {
        let header = PayloadHeader {
            channel,
            sequence,
            timestamp: u32::from(sequence) * 160,
            format: CodecFormat::G729a.wire_code(),
            flags: 0,
        };
        let mut buf = BytesMut::new();
        encode_payload(LinkAddrs::default().to_host(), &header, data, &mut buf).unwrap();
        let mut frame = Frame::empty_rx();
        frame.fill(&buf).unwrap();
        frame
    }

    #[test]
    fn writes_carry_running_sequence_and_timestamp() {
        let router = router(RouterConfig::default());
        let handle = open(&router);
        for _ in 0..3 {
            assert_eq!(router.enqueue_outbound(&handle, &[0xff; 160]).unwrap(), WriteOutcome::Queued);
        }

        let mut headers = Vec::new();
        while router.transport.rings().tx.complete_next(|f| {
            headers.push(decode_payload(f.as_bytes()).unwrap().0);
            Some(f.len())
        }) {}
        let seen: Vec<(u16, u16, u32)> = headers.iter().map(|h| (h.channel, h.sequence, h.timestamp)).collect();
        assert_eq!(seen, vec![(10, 0, 0), (10, 1, 160), (10, 2, 320)]);
        assert_eq!(router.in_flight(ENC0), 480);
    }

    #[test]
    fn flow_control_drops_over_cap() {
        let router = router(RouterConfig {
            max_samples_in_flight: 320,
            ..RouterConfig::default()
        });
        let handle = open(&router);
        assert_eq!(router.enqueue_outbound(&handle, &[0; 160]).unwrap(), WriteOutcome::Queued);
        assert_eq!(router.enqueue_outbound(&handle, &[0; 160]).unwrap(), WriteOutcome::Queued);
        assert_eq!(router.enqueue_outbound(&handle, &[0; 160]).unwrap(), WriteOutcome::Dropped);
        assert_eq!(router.stats().throttled, 1);

        // A returned G.729A frame releases 160 samples.
        router.on_payload_frame(inbound(11, 0, &[1; 20]));
        assert_eq!(router.in_flight(ENC0), 160);
        assert_eq!(router.enqueue_outbound(&handle, &[0; 160]).unwrap(), WriteOutcome::Queued);
    }

    #[test]
    fn routes_by_device_channel() {
        let router = router(RouterConfig::default());
        let handle = open(&router);
        router.on_payload_frame(inbound(11, 5, &[7; 20]));
        router.on_payload_frame(inbound(12, 6, &[7; 20]));
        assert_eq!(router.stats().unrouted, 1);

        let payload = router.read(&handle, ReadMode::NonBlocking).unwrap();
        assert_eq!(payload.sequence, 5);
        assert_eq!(payload.format, Some(CodecFormat::G729a));
        assert_eq!(payload.data.len(), 20);
        assert!(matches!(router.read(&handle, ReadMode::NonBlocking), Err(DeviceError::WouldBlock)));
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let router = router(RouterConfig {
            max_queued_frames: 2,
            ..RouterConfig::default()
        });
        let handle = open(&router);
        for seq in 0..3 {
            router.on_payload_frame(inbound(11, seq, &[0; 20]));
        }
        assert_eq!(router.queued(ENC0), 2);
        assert_eq!(router.read(&handle, ReadMode::NonBlocking).unwrap().sequence, 1);
        assert_eq!(router.stats().overflowed, 1);
    }

    #[test]
    fn read_into_refuses_to_truncate() {
        let router = router(RouterConfig::default());
        let handle = open(&router);
        router.on_payload_frame(inbound(11, 0, &[3; 20]));

        let mut small = [0u8; 10];
        assert!(matches!(
            router.read_into(&handle, &mut small, ReadMode::NonBlocking),
            Err(DeviceError::BufferTooSmall { needed: 20, got: 10 })
        ));
        assert_eq!(router.queued(ENC0), 1);

        let mut buf = [0u8; 64];
        assert_eq!(router.read_into(&handle, &mut buf, ReadMode::NonBlocking).unwrap(), 20);
        assert_eq!(&buf[..20], &[3; 20]);
    }

    #[test]
    fn timed_read_expires() {
        let router = router(RouterConfig::default());
        let handle = open(&router);
        let err = router.read(&handle, ReadMode::Timeout(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, DeviceError::ReadTimeout(_)));
    }

    #[test]
    fn blocking_read_wakes_on_delivery() {
        let router = router(RouterConfig::default());
        let handle = open(&router);
        let reader = {
            let router = router.clone();
            thread::spawn(move || router.read(&handle, ReadMode::Blocking))
        };
        thread::sleep(Duration::from_millis(20));
        router.on_payload_frame(inbound(11, 9, &[0; 20]));
        assert_eq!(reader.join().unwrap().unwrap().sequence, 9);
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let router = router(RouterConfig::default());
        let handle = open(&router);
        let reader = {
            let router = router.clone();
            thread::spawn(move || router.read(&handle, ReadMode::Blocking))
        };
        thread::sleep(Duration::from_millis(20));
        router.close_all(CloseReason::Faulted);
        assert!(matches!(
            reader.join().unwrap(),
            Err(DeviceError::DeviceFault(FaultSeverity::Fatal))
        ));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let router = router(RouterConfig::default());
        let handle = open(&router);
        router.unbind(ENC0);
        assert!(matches!(
            router.enqueue_outbound(&handle, &[0; 160]),
            Err(DeviceError::InvalidChannel(_))
        ));
        router.on_payload_frame(inbound(11, 0, &[0; 20]));
        assert_eq!(router.stats().unrouted, 1);
    }
}
