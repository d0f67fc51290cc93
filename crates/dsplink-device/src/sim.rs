//! Firmware emulator.
//!
//! Plays the device side of a ring pair: consumes submitted frames, answers
//! commands and "transcodes" payload by emitting a destination-format-sized
//! frame on the connected peer channel. Used by the integration tests and
//! by the CLI when no hardware is present.
//!
//! Fault injection knobs can be changed while the emulator runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use dsplink_frame::{
    class, classify, decode_control, decode_payload, encode_control, encode_payload, function,
    kind, ControlFlags, ControlMessage, LinkAddrs, PayloadHeader, Route, SubCommand, SUPERVISOR,
};
use dsplink_ring::{doorbell, Doorbell, DoorbellWaiter, FrameClass, RingPair};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::millis;
use crate::device::BoardControl;
use crate::error::Result;
use crate::format::CodecFormat;

/// Response status: out of channel resources.
pub const STATUS_NO_RESOURCES: u16 = 0x0001;
/// Response status: no such device channel.
pub const STATUS_BAD_CHANNEL: u16 = 0x0002;
/// Response status: timeslot already carries a channel.
pub const STATUS_TIMESLOT_BUSY: u16 = 0x0003;
/// Response status: function not implemented.
pub const STATUS_UNKNOWN_FUNCTION: u16 = 0x00FF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Device channels the firmware can create.
    pub max_channels: u16,
    /// Silently discard this many command frames.
    pub drop_commands: usize,
    /// Send every reply twice.
    pub duplicate_replies: bool,
    /// Consume frames but never answer.
    pub mute: bool,
    /// Answer this function with this status instead of executing it.
    pub reject: Option<(u16, u16)>,
    #[serde(with = "millis", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    #[serde(skip)]
    pub link: LinkAddrs,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_channels: 256,
            drop_commands: 0,
            duplicate_replies: false,
            mute: false,
            reject: None,
            poll_interval: Duration::from_millis(1),
            link: LinkAddrs::default(),
        }
    }
}

/// Counters kept by the emulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    /// Command frames received, including retransmissions.
    pub commands: u64,
    /// Retransmissions answered from the reply cache.
    pub replayed: u64,
    pub dropped: u64,
    pub acks_received: u64,
    pub payload_in: u64,
    pub payload_out: u64,
    pub frames_out: u64,
    pub resets: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SimChannel {
    timeslot: u16,
    port: u16,
    format: Option<CodecFormat>,
    peer: Option<u16>,
    enabled: bool,
    tone_detection: bool,
    out_sequence: u16,
    out_timestamp: u32,
}

#[derive(Default)]
struct SimState {
    channels: BTreeMap<u16, SimChannel>,
    next_number: u16,
    outbox: VecDeque<Vec<u8>>,
    /// Last reply per channel, keyed by the command sequence it answered.
    replies: HashMap<u16, (u8, Vec<u8>)>,
    indication_sequence: u8,
    stats: SimStats,
    per_function: HashMap<u16, u64>,
}

impl SimState {
    fn allocate_number(&mut self) -> u16 {
        loop {
            let number = self.next_number;
            self.next_number = self.next_number.wrapping_add(1);
            if number != SUPERVISOR && !self.channels.contains_key(&number) {
                return number;
            }
        }
    }
}

struct SimInner {
    rings: RingPair,
    route: Route,
    knobs: Mutex<SimConfig>,
    state: Mutex<SimState>,
    bell: Doorbell,
    stop: AtomicBool,
}

impl SimInner {
    fn run(&self, waiter: DoorbellWaiter) {
        debug!("emulator started");
        while !self.stop.load(Ordering::Acquire) {
            let interval = self.knobs().poll_interval;
            waiter.wait(interval);
            self.step();
        }
        debug!("emulator stopped");
    }

    fn step(&self) {
        loop {
            let mut taken = None;
            let completed = self.rings.tx.complete_next(|frame| {
                taken = Some(frame.as_bytes().to_vec());
                Some(frame.len())
            });
            if !completed {
                break;
            }
            if let Some(bytes) = taken {
                self.handle(&bytes);
            }
        }
        self.flush_outbox();
    }

    fn handle(&self, bytes: &[u8]) {
        match classify(bytes) {
            Ok((FrameClass::Control, _)) => match decode_control(bytes) {
                Ok(msg) => self.handle_control(msg),
                Err(err) => warn!(error = %err, "emulator got malformed control frame"),
            },
            Ok((FrameClass::Payload, _)) => self.handle_payload(bytes),
            Ok(_) | Err(_) => trace!(len = bytes.len(), "emulator ignoring frame"),
        }
    }

    fn handle_control(&self, msg: ControlMessage) {
        let mut state = self.state();
        if msg.control.is_ack() {
            state.stats.acks_received += 1;
            return;
        }
        state.stats.commands += 1;
        if let Some(function) = msg.function() {
            *state.per_function.entry(function).or_default() += 1;
        }

        let (mute, duplicate, reject) = {
            let mut knobs = self.knobs();
            if knobs.drop_commands > 0 {
                knobs.drop_commands -= 1;
                state.stats.dropped += 1;
                trace!(seq = msg.sequence, "emulator dropping command");
                return;
            }
            (knobs.mute, knobs.duplicate_replies, knobs.reject)
        };
        if mute {
            return;
        }

        let replayed = match state.replies.get(&msg.channel) {
            Some((sequence, bytes)) if *sequence == msg.sequence => Some(bytes.clone()),
            _ => None,
        };
        if let Some(bytes) = replayed {
            state.stats.replayed += 1;
            state.outbox.push_back(bytes);
            return;
        }

        let Some(sub) = msg.subcommands.first() else {
            return;
        };
        let (status, results) = match reject {
            Some((function, status)) if function == sub.function => (status, Vec::new()),
            _ => self.execute(&mut state, &msg, sub),
        };

        let reply = if msg.control.suppresses_ack() {
            let mut params = Vec::with_capacity(results.len() + 1);
            params.push(status);
            params.extend(results);
            ControlMessage {
                sequence: msg.sequence,
                control: ControlFlags::RESPONSE.with(ControlFlags::SUPPRESS_ACK),
                channel: msg.channel,
                subcommands: vec![SubCommand::new(sub.kind, sub.class, sub.function, params)],
            }
        } else {
            ControlMessage::ack(msg.sequence, msg.channel)
        };

        let mut buf = BytesMut::new();
        if let Err(err) = encode_control(self.route, &reply, &mut buf) {
            warn!(error = %err, "emulator failed to encode reply");
            return;
        }
        let bytes = buf.to_vec();
        state.replies.insert(msg.channel, (msg.sequence, bytes.clone()));
        if duplicate {
            state.outbox.push_back(bytes.clone());
        }
        state.outbox.push_back(bytes);
    }

    fn execute(&self, state: &mut SimState, msg: &ControlMessage, sub: &SubCommand) -> (u16, Vec<u16>) {
        let param = |i: usize| sub.params.get(i).copied().unwrap_or(0);
        let max_channels = usize::from(self.knobs().max_channels);

        match sub.function {
            function::CREATE_CHANNEL => {
                if state.channels.len() >= max_channels {
                    return (STATUS_NO_RESOURCES, Vec::new());
                }
                if state.channels.values().any(|c| c.timeslot == param(0)) {
                    return (STATUS_TIMESLOT_BUSY, Vec::new());
                }
                let number = state.allocate_number();
                state.channels.insert(
                    number,
                    SimChannel {
                        timeslot: param(0),
                        ..SimChannel::default()
                    },
                );
                trace!(number, timeslot = param(0), "emulator created channel");
                (0, vec![number])
            }
            function::DESTROY_CHANNEL => {
                let number = param(0);
                if state.channels.remove(&number).is_none() {
                    return (STATUS_BAD_CHANNEL, Vec::new());
                }
                for channel in state.channels.values_mut() {
                    if channel.peer == Some(number) {
                        channel.peer = None;
                    }
                }
                state.replies.remove(&number);
                (0, Vec::new())
            }
            function::SET_IP_HEADER
            | function::VOICE_OPTIONS
            | function::TONE_CONTROL
            | function::VOICE_ENABLE => {
                let Some(channel) = state.channels.get_mut(&msg.channel) else {
                    return (STATUS_BAD_CHANNEL, Vec::new());
                };
                match sub.function {
                    function::SET_IP_HEADER => channel.port = param(0),
                    function::VOICE_OPTIONS => {
                        channel.format = u8::try_from(param(0)).ok().and_then(CodecFormat::from_wire);
                    }
                    function::TONE_CONTROL => channel.tone_detection = param(0) != 0,
                    _ => channel.enabled = param(0) != 0,
                }
                (0, Vec::new())
            }
            function::CONNECT | function::DISCONNECT => {
                let (a, b) = (param(0), param(1));
                if !state.channels.contains_key(&a) || !state.channels.contains_key(&b) {
                    return (STATUS_BAD_CHANNEL, Vec::new());
                }
                let link = |peer: u16| (sub.function == function::CONNECT).then_some(peer);
                if let Some(channel) = state.channels.get_mut(&a) {
                    channel.peer = link(b);
                }
                if let Some(channel) = state.channels.get_mut(&b) {
                    channel.peer = link(a);
                }
                (0, Vec::new())
            }
            function::GET_STATISTICS => {
                let rx = u32::try_from(state.stats.commands + state.stats.payload_in).unwrap_or(u32::MAX);
                let tx = u32::try_from(state.stats.frames_out).unwrap_or(u32::MAX);
                let active = u16::try_from(state.channels.len()).unwrap_or(u16::MAX);
                let results = vec![
                    (rx >> 16) as u16,
                    rx as u16,
                    (tx >> 16) as u16,
                    tx as u16,
                    active,
                    active.saturating_mul(3).min(100),
                    0,
                ];
                (0, results)
            }
            function::PING
            | function::SET_CLOCK
            | function::TDM_SELECT_BUS_MODE
            | function::SET_ETH_HEADER
            | function::IP_SERVICE_CONFIG
            | function::ARP_SERVICE_CONFIG
            | function::ICMP_SERVICE_CONFIG
            | function::SET_ALERT_MODE => (0, Vec::new()),
            other => {
                debug!(function = other, "emulator got unknown function");
                (STATUS_UNKNOWN_FUNCTION, Vec::new())
            }
        }
    }

    fn handle_payload(&self, bytes: &[u8]) {
        let Ok((header, data)) = decode_payload(bytes) else {
            return;
        };
        let mut state = self.state();
        state.stats.payload_in += 1;

        let Some(source) = state.channels.get(&header.channel).copied() else {
            trace!(channel = header.channel, "payload for unknown channel");
            return;
        };
        let (Some(peer), Some(src_format), true) = (source.peer, source.format, source.enabled) else {
            trace!(channel = header.channel, "payload on unconnected channel");
            return;
        };
        let Some(target) = state.channels.get_mut(&peer) else {
            return;
        };
        let Some(dst_format) = target.format else {
            return;
        };

        let samples = src_format.samples(data.len());
        let out_len = dst_format.bytes_for(samples);
        if out_len == 0 || data.is_empty() {
            return;
        }
        let out: Vec<u8> = (0..out_len)
            .map(|i| data[i % data.len()] ^ (i as u8))
            .collect();

        let out_header = PayloadHeader {
            channel: peer,
            sequence: target.out_sequence,
            timestamp: target.out_timestamp,
            format: dst_format.wire_code(),
            flags: 0,
        };
        target.out_sequence = target.out_sequence.wrapping_add(1);
        target.out_timestamp = target.out_timestamp.wrapping_add(samples);

        let mut buf = BytesMut::new();
        if let Err(err) = encode_payload(self.route, &out_header, &out, &mut buf) {
            warn!(error = %err, "emulator failed to encode payload");
            return;
        }
        state.stats.payload_out += 1;
        state.outbox.push_back(buf.to_vec());
    }

    fn flush_outbox(&self) {
        let mut state = self.state();
        while let Some(front) = state.outbox.front() {
            let delivered = self.rings.rx.complete_next(|buffer| {
                buffer.fill(front).ok()?;
                Some(front.len())
            });
            if !delivered {
                break;
            }
            state.outbox.pop_front();
            state.stats.frames_out += 1;
        }
    }

    fn queue_message(&self, msg: &ControlMessage) {
        let mut buf = BytesMut::new();
        match encode_control(self.route, msg, &mut buf) {
            Ok(()) => self.state().outbox.push_back(buf.to_vec()),
            Err(err) => warn!(error = %err, "emulator failed to encode message"),
        }
        self.bell.ring();
    }

    fn knobs(&self) -> MutexGuard<'_, SimConfig> {
        self.knobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BoardControl for SimInner {
    fn reset(&self) -> io::Result<()> {
        let mut state = self.state();
        let stats = SimStats {
            resets: state.stats.resets + 1,
            ..state.stats
        };
        let per_function = std::mem::take(&mut state.per_function);
        *state = SimState {
            stats,
            per_function,
            ..SimState::default()
        };
        debug!(resets = stats.resets, "emulator reset");
        Ok(())
    }
}

/// A running firmware emulator.
pub struct Emulator {
    inner: Arc<SimInner>,
    thread: Option<JoinHandle<()>>,
}

impl Emulator {
    /// Attach to the device side of `rings` and start answering.
    pub fn spawn(config: SimConfig, rings: RingPair) -> Result<Self> {
        let (bell, waiter) = doorbell();
        rings.tx.connect_device(bell.clone());
        rings.rx.connect_device(bell.clone());

        let inner = Arc::new(SimInner {
            route: config.link.to_host(),
            rings,
            knobs: Mutex::new(config),
            state: Mutex::new(SimState::default()),
            bell,
            stop: AtomicBool::new(false),
        });
        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name("dsplink-sim".to_string())
            .spawn(move || worker.run(waiter))?;
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    pub fn rings(&self) -> RingPair {
        self.inner.rings.clone()
    }

    /// Reset line for [`Device::attach`](crate::Device::attach).
    pub fn board(&self) -> Arc<dyn BoardControl> {
        self.inner.clone()
    }

    pub fn stats(&self) -> SimStats {
        self.inner.state().stats
    }

    /// Frames received for `function`, retransmissions included.
    pub fn commands_seen(&self, function: u16) -> u64 {
        self.inner.state().per_function.get(&function).copied().unwrap_or(0)
    }

    /// Device channels currently created.
    pub fn live_channels(&self) -> usize {
        self.inner.state().channels.len()
    }

    /// Peer of a device channel, if connected.
    pub fn peer_of(&self, number: u16) -> Option<u16> {
        self.inner.state().channels.get(&number).and_then(|c| c.peer)
    }

    pub fn set_mute(&self, mute: bool) {
        self.inner.knobs().mute = mute;
    }

    pub fn set_drop_commands(&self, count: usize) {
        self.inner.knobs().drop_commands = count;
    }

    pub fn set_duplicate_replies(&self, duplicate: bool) {
        self.inner.knobs().duplicate_replies = duplicate;
    }

    pub fn set_reject(&self, reject: Option<(u16, u16)>) {
        self.inner.knobs().reject = reject;
    }

    /// Send an alert indication to the host.
    pub fn inject_alert(&self, code: u16, severity: u16) {
        let sequence = {
            let mut state = self.inner.state();
            let sequence = state.indication_sequence;
            state.indication_sequence = sequence.wrapping_add(1);
            sequence
        };
        let msg = ControlMessage {
            sequence,
            control: ControlFlags::empty(),
            channel: SUPERVISOR,
            subcommands: vec![SubCommand::new(
                kind::INDICATION,
                class::DEVICE,
                function::ALERT_INDICATION,
                vec![code, severity],
            )],
        };
        self.inner.queue_message(&msg);
    }

    /// Send an arbitrary control message to the host.
    pub fn inject(&self, msg: &ControlMessage) {
        self.inner.queue_message(msg);
    }

    /// Stop the emulator thread.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.inner.stop.store(true, Ordering::Release);
        self.inner.bell.ring();
        if thread.join().is_err() {
            warn!("emulator thread panicked");
        }
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Emulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emulator")
            .field("rings", &self.inner.rings)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use dsplink_ring::{Frame, RingConfig};

    use super::*;
    use crate::command::Command;

    fn rings() -> RingPair {
        RingPair::new(&RingConfig {
            tx_capacity: 8,
            rx_capacity: 8,
        })
        .unwrap()
    }

    /// Drive the emulator by hand instead of through its thread.
    fn inner() -> SimInner {
        let (bell, _waiter) = doorbell();
        let rings = rings();
        for _ in 0..8 {
            rings.rx.submit(Frame::empty_rx()).unwrap();
        }
        SimInner {
            route: LinkAddrs::default().to_host(),
            rings,
            knobs: Mutex::new(SimConfig::default()),
            state: Mutex::new(SimState::default()),
            bell,
            stop: AtomicBool::new(false),
        }
    }

    fn send(sim: &SimInner, cmd: &Command, sequence: u8) -> Vec<ControlMessage> {
        let mut buf = BytesMut::new();
        encode_control(LinkAddrs::default().to_device(), &cmd.to_message(sequence), &mut buf).unwrap();
        sim.handle(&buf);
        let outbox: Vec<Vec<u8>> = sim.state().outbox.drain(..).collect();
        outbox.iter().map(|b| decode_control(b).unwrap()).collect()
    }

    #[test]
    fn creates_and_destroys_channels() {
        let sim = inner();
        let replies = send(&sim, &Command::create_channel(0), 0);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].control.is_response());
        assert_eq!(replies[0].params(), &[0, 0]);

        let replies = send(&sim, &Command::create_channel(1), 1);
        assert_eq!(replies[0].params(), &[0, 1]);
        assert_eq!(sim.state().channels.len(), 2);

        let replies = send(&sim, &Command::destroy_channel(0), 2);
        assert_eq!(replies[0].params(), &[0]);
        let replies = send(&sim, &Command::destroy_channel(0), 3);
        assert_eq!(replies[0].params(), &[STATUS_BAD_CHANNEL]);
    }

    #[test]
    fn timeslots_hold_one_channel() {
        let sim = inner();
        send(&sim, &Command::create_channel(4), 0);
        let replies = send(&sim, &Command::create_channel(4), 1);
        assert_eq!(replies[0].params(), &[STATUS_TIMESLOT_BUSY]);

        send(&sim, &Command::destroy_channel(0), 2);
        let replies = send(&sim, &Command::create_channel(4), 3);
        assert_eq!(replies[0].params()[0], 0);
    }

    #[test]
    fn config_changes_are_acked() {
        let sim = inner();
        send(&sim, &Command::create_channel(0), 0);
        let replies = send(&sim, &Command::voice_enable(0, true), 0);
        assert_eq!(replies, vec![ControlMessage::ack(0, 0)]);
        assert!(sim.state().channels[&0].enabled);
    }

    #[test]
    fn retransmission_replays_cached_reply() {
        let sim = inner();
        let first = send(&sim, &Command::create_channel(0), 5);
        let again = send(&sim, &Command::create_channel(0), 5);
        assert_eq!(first, again);
        assert_eq!(sim.state().channels.len(), 1);
        assert_eq!(sim.state().stats.replayed, 1);
    }

    #[test]
    fn reject_knob_overrides_status() {
        let sim = inner();
        sim.knobs().reject = Some((function::CONNECT, 9));
        let replies = send(&sim, &Command::connect(0, 1, CodecFormat::Ulaw, CodecFormat::G729a), 0);
        assert_eq!(replies[0].params(), &[9]);
    }

    #[test]
    fn transcodes_to_peer_format() {
        let sim = inner();
        send(&sim, &Command::create_channel(0), 0);
        send(&sim, &Command::create_channel(1), 1);
        send(&sim, &Command::voice_options(0, CodecFormat::Ulaw, &Default::default()), 0);
        send(&sim, &Command::voice_options(1, CodecFormat::G729a, &Default::default()), 0);
        send(&sim, &Command::voice_enable(0, true), 1);
        send(&sim, &Command::voice_enable(1, true), 1);
        send(&sim, &Command::connect(0, 1, CodecFormat::Ulaw, CodecFormat::G729a), 2);

        let header = PayloadHeader {
            channel: 0,
            sequence: 0,
            timestamp: 0,
            format: CodecFormat::Ulaw.wire_code(),
            flags: 0,
        };
        let mut buf = BytesMut::new();
        encode_payload(LinkAddrs::default().to_device(), &header, &[0x55; 160], &mut buf).unwrap();
        sim.handle(&buf);

        let out = sim.state().outbox.pop_front().unwrap();
        let (header, data) = decode_payload(&out).unwrap();
        assert_eq!(header.channel, 1);
        assert_eq!(header.sequence, 0);
        assert_eq!(header.format, CodecFormat::G729a.wire_code());
        assert_eq!(data.len(), 20);
    }

    #[test]
    fn reset_forgets_channels_but_keeps_counters() {
        let sim = inner();
        send(&sim, &Command::create_channel(0), 0);
        sim.reset().unwrap();
        let state = sim.state();
        assert!(state.channels.is_empty());
        assert_eq!(state.stats.resets, 1);
        assert_eq!(state.stats.commands, 1);
        assert_eq!(state.per_function[&function::CREATE_CHANNEL], 1);
    }

    #[test]
    fn outbox_waits_for_receive_buffers() {
        let sim = inner();
        for seq in 0..12 {
            sim.queue_message(&ControlMessage::ack(seq, SUPERVISOR));
        }
        sim.flush_outbox();
        assert_eq!(sim.state().outbox.len(), 4);
        assert_eq!(sim.rings.rx.device_owned(), 0);
    }
}
