//! Reliable command delivery over the control stream.
//!
//! Every command waiting for an ack or a response sits in an ordered
//! outstanding list together with its encoded frame. The frame is owned by
//! the transport while it is on the ring and comes back to its entry when
//! transmission completes, so a retransmission resubmits exactly the bytes
//! the device saw the first time.
//!
//! Matching rules:
//! - acks match `(channel, sequence)` of an entry waiting for an ack
//! - responses match `(channel, function)` of the oldest entry waiting for a
//!   response; a response whose sequence equals the last one accepted on
//!   that channel is a duplicate and is dropped
//!
//! The response sequence is not part of the match. Callers keep at most one
//! command per `(channel, function)` in flight, so the oldest entry is the
//! one being answered. A stale response with an older sequence that arrives
//! after a newer command of the same function was submitted will complete
//! that newer command; only exact repeats of the last accepted sequence are
//! filtered.
//!
//! The engine never drives the link itself. [`Device::service`] feeds it
//! completed frames and calls [`CommandEngine::sweep`] after every drain.
//!
//! [`Device::service`]: crate::Device::service

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dsplink_frame::{
    decode_control, encode_control, function, ControlMessage, FrameTransport, Route,
    LINK_HEADER_SIZE,
};
use dsplink_ring::{Doorbell, Frame, FrameClass};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::command::{Command, Reply};
use crate::config::EngineConfig;
use crate::error::{DeviceError, Result};
use crate::fault::{FaultMonitor, FaultSeverity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Ack,
    Response,
}

struct Outstanding {
    token: u64,
    channel: u16,
    function: u16,
    sequence: u8,
    awaiting: Awaiting,
    /// `None` while the transport holds the frame.
    frame: Option<Frame>,
    timeout: Duration,
    deadline: Instant,
    retries: u32,
    transmissions: u32,
    done: SyncSender<Result<Reply>>,
}

impl Outstanding {
    fn complete(self, result: Result<Reply>) {
        // The caller may have given up; nothing to do then.
        let _ = self.done.send(result);
    }
}

#[derive(Default)]
struct EngineState {
    outstanding: VecDeque<Outstanding>,
    next_sequence: HashMap<u16, u8>,
    last_accepted: HashMap<u16, u8>,
    next_token: u64,
}

impl EngineState {
    fn sequence_for(&mut self, channel: u16) -> u8 {
        let next = self.next_sequence.entry(channel).or_insert(0);
        let sequence = *next;
        *next = next.wrapping_add(1);
        sequence
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    retransmitted: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    unmatched: AtomicU64,
    acks_sent: AtomicU64,
    indications: AtomicU64,
    malformed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counters kept by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub submitted: u64,
    pub completed: u64,
    pub retransmitted: u64,
    pub timed_out: u64,
    /// Commands failed by a fatal fault or a reset.
    pub failed: u64,
    pub duplicates: u64,
    /// Acks and responses that matched no outstanding command.
    pub unmatched: u64,
    pub acks_sent: u64,
    pub indications: u64,
    pub malformed: u64,
    pub outstanding: usize,
}

/// What [`CommandEngine::on_control`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Completed,
    Duplicate,
    Unmatched,
    /// Device-originated message other than an alert.
    Indication,
    Alert(FaultSeverity),
    Malformed,
}

/// What one [`CommandEngine::sweep`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub retransmitted: usize,
    pub expired: usize,
    /// Expired entries whose frame has not left the ring yet.
    pub repoll: bool,
}

/// A submitted command's completion.
#[derive(Debug)]
pub struct PendingReply {
    rx: Receiver<Result<Reply>>,
}

impl PendingReply {
    /// Block until the command completes. The device must be serviced
    /// meanwhile, or this never returns.
    pub fn wait(self) -> Result<Reply> {
        self.rx.recv().unwrap_or(Err(DeviceError::Shutdown))
    }

    /// The completion, if it already arrived.
    pub fn try_take(&self) -> Option<Result<Reply>> {
        self.rx.try_recv().ok()
    }
}

/// Sequence numbering, reply matching and retransmission for one device.
pub struct CommandEngine {
    transport: Arc<FrameTransport>,
    route: Route,
    config: EngineConfig,
    faults: Arc<FaultMonitor>,
    wake: Doorbell,
    state: Mutex<EngineState>,
    counters: Counters,
}

impl CommandEngine {
    /// `wake` is rung after every submission so the service loop flushes it.
    pub fn new(
        transport: Arc<FrameTransport>,
        route: Route,
        config: EngineConfig,
        faults: Arc<FaultMonitor>,
        wake: Doorbell,
    ) -> Self {
        Self {
            transport,
            route,
            config,
            faults,
            wake,
            state: Mutex::new(EngineState::default()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn faults(&self) -> &Arc<FaultMonitor> {
        &self.faults
    }

    /// Queue a command and return a handle to its completion.
    pub fn submit(&self, cmd: &Command, timeout: Duration) -> Result<PendingReply> {
        let (done, rx) = mpsc::sync_channel(1);
        let channel = cmd.channel();
        let function = cmd.function();

        let (frame, sequence) = {
            let mut state = self.lock();
            if self.faults.is_fatal() {
                return Err(DeviceError::DeviceFault(FaultSeverity::Fatal));
            }
            let sequence = state.sequence_for(channel);
            let token = state.token();
            let frame = self.encode(&cmd.to_message(sequence), Some(token))?;
            let awaiting = if cmd.flags().needs_response {
                Awaiting::Response
            } else {
                Awaiting::Ack
            };
            state.outstanding.push_back(Outstanding {
                token,
                channel,
                function,
                sequence,
                awaiting,
                frame: None,
                timeout,
                deadline: Instant::now() + timeout,
                retries: 0,
                transmissions: 1,
                done,
            });
            (frame, sequence)
        };

        bump(&self.counters.submitted);
        debug!(
            channel,
            function = function::name(function),
            seq = sequence,
            "command submitted"
        );
        self.transport.send(frame);
        self.wake.ring();
        Ok(PendingReply { rx })
    }

    /// Send a command and block until it is answered, times out or the
    /// device faults.
    pub fn send_and_wait(&self, cmd: &Command, timeout: Duration) -> Result<Reply> {
        self.submit(cmd, timeout)?.wait()
    }

    /// [`send_and_wait`](Self::send_and_wait) with the configured timeout.
    pub fn call(&self, cmd: &Command) -> Result<Reply> {
        self.send_and_wait(cmd, self.config.command_timeout)
    }

    /// Send a command without tracking it. No retries, no completion.
    pub fn send_and_forget(&self, cmd: &Command) -> Result<()> {
        let msg = {
            let mut state = self.lock();
            let sequence = state.sequence_for(cmd.channel());
            cmd.to_message(sequence)
        };
        trace!(
            channel = msg.channel,
            function = function::name(cmd.function()),
            seq = msg.sequence,
            "command sent untracked"
        );
        self.send_untracked(&msg)
    }

    /// Encode `msg` without a completion token and hand it to the transport.
    fn send_untracked(&self, msg: &ControlMessage) -> Result<()> {
        let frame = self.encode(msg, None)?;
        self.transport.send(frame);
        self.wake.ring();
        Ok(())
    }

    /// A frame came back from the submit ring.
    pub fn on_transmitted(&self, frame: Frame) {
        let Some(token) = frame.tag().token else {
            return;
        };
        let mut state = self.lock();
        match state.outstanding.iter_mut().find(|e| e.token == token) {
            Some(entry) => entry.frame = Some(frame),
            None => trace!(frame = %frame.id(), "transmitted frame of a finished command"),
        }
    }

    /// An inbound control frame.
    pub fn on_control(&self, frame: Frame) -> ControlOutcome {
        let msg = match decode_control(frame.as_bytes()) {
            Ok(msg) => msg,
            Err(err) => {
                bump(&self.counters.malformed);
                debug!(error = %err, "dropping malformed control frame");
                return ControlOutcome::Malformed;
            }
        };

        if msg.control.is_ack() {
            self.complete_ack(&msg)
        } else if msg.control.is_response() {
            self.complete_response(msg)
        } else {
            self.on_indication(&msg)
        }
    }

    fn complete_ack(&self, msg: &ControlMessage) -> ControlOutcome {
        let entry = {
            let mut state = self.lock();
            state
                .outstanding
                .iter()
                .position(|e| {
                    e.awaiting == Awaiting::Ack
                        && e.channel == msg.channel
                        && e.sequence == msg.sequence
                })
                .and_then(|pos| state.outstanding.remove(pos))
        };
        let Some(entry) = entry else {
            return self.unmatched(msg, "ack");
        };
        bump(&self.counters.completed);
        debug!(
            channel = entry.channel,
            function = function::name(entry.function),
            seq = msg.sequence,
            "command acked"
        );
        entry.complete(Ok(Reply::Ack {
            sequence: msg.sequence,
        }));
        ControlOutcome::Completed
    }

    fn complete_response(&self, msg: ControlMessage) -> ControlOutcome {
        let Some(function) = msg.function() else {
            return self.unmatched(&msg, "response");
        };
        let entry = {
            let mut state = self.lock();
            if state.last_accepted.get(&msg.channel) == Some(&msg.sequence) {
                drop(state);
                bump(&self.counters.duplicates);
                debug!(
                    channel = msg.channel,
                    function = function::name(function),
                    seq = msg.sequence,
                    "duplicate response dropped"
                );
                return ControlOutcome::Duplicate;
            }
            let pos = state.outstanding.iter().position(|e| {
                e.awaiting == Awaiting::Response && e.channel == msg.channel && e.function == function
            });
            let entry = pos.and_then(|pos| state.outstanding.remove(pos));
            if entry.is_some() {
                state.last_accepted.insert(msg.channel, msg.sequence);
            }
            entry
        };
        let Some(entry) = entry else {
            return self.unmatched(&msg, "response");
        };
        bump(&self.counters.completed);
        debug!(
            channel = msg.channel,
            function = function::name(function),
            seq = msg.sequence,
            status = msg.params().first().copied().unwrap_or(0),
            "command answered"
        );
        entry.complete(Ok(Reply::Response(msg)));
        ControlOutcome::Completed
    }

    fn unmatched(&self, msg: &ControlMessage, what: &'static str) -> ControlOutcome {
        bump(&self.counters.unmatched);
        debug!(
            channel = msg.channel,
            seq = msg.sequence,
            function = msg.function().map(function::name),
            what,
            "reply matches no outstanding command"
        );
        ControlOutcome::Unmatched
    }

    fn on_indication(&self, msg: &ControlMessage) -> ControlOutcome {
        bump(&self.counters.indications);
        if !msg.control.suppresses_ack() {
            self.acknowledge(msg.sequence, msg.channel);
        }

        if msg.function() != Some(function::ALERT_INDICATION) {
            debug!(
                channel = msg.channel,
                function = msg.function().map(function::name),
                "unsolicited device message"
            );
            return ControlOutcome::Indication;
        }

        let params = msg.params();
        let code = params.first().copied().unwrap_or(0);
        let severity = FaultSeverity::from_alert(params.get(1).copied().unwrap_or(0));
        let escalated = self.faults.alert(code, severity);
        match severity {
            FaultSeverity::Fatal => {
                error!(code, "fatal device alert");
                if escalated {
                    self.fail_outstanding(|| DeviceError::DeviceFault(FaultSeverity::Fatal));
                }
            }
            FaultSeverity::Soft => warn!(code, "device alert"),
        }
        ControlOutcome::Alert(severity)
    }

    fn acknowledge(&self, sequence: u8, channel: u16) {
        match self.send_untracked(&ControlMessage::ack(sequence, channel)) {
            Ok(()) => {
                bump(&self.counters.acks_sent);
                trace!(channel, seq = sequence, "acked device message");
            }
            Err(err) => warn!(error = %err, channel, "failed to send ack"),
        }
    }

    /// Retransmit or expire every entry whose deadline passed.
    pub fn sweep(&self, now: Instant) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let mut resend = Vec::new();
        let mut expired = Vec::new();

        {
            let mut state = self.lock();
            let mut i = 0;
            while i < state.outstanding.len() {
                let entry = &mut state.outstanding[i];
                if entry.deadline > now {
                    i += 1;
                    continue;
                }
                entry.retries += 1;
                if entry.retries > self.config.max_retries {
                    if let Some(entry) = state.outstanding.remove(i) {
                        expired.push(entry);
                    }
                    continue;
                }
                entry.deadline = now + entry.timeout;
                match entry.frame.take() {
                    Some(frame) => {
                        entry.transmissions += 1;
                        warn!(
                            channel = entry.channel,
                            function = function::name(entry.function),
                            seq = entry.sequence,
                            retries = entry.retries,
                            "no reply, retransmitting"
                        );
                        resend.push(frame);
                    }
                    None => {
                        debug!(
                            channel = entry.channel,
                            seq = entry.sequence,
                            retries = entry.retries,
                            "command still on the ring"
                        );
                        summary.repoll = true;
                    }
                }
                i += 1;
            }
        }

        summary.retransmitted = resend.len();
        for frame in resend {
            bump(&self.counters.retransmitted);
            self.transport.send(frame);
        }

        summary.expired = expired.len();
        for entry in expired {
            bump(&self.counters.timed_out);
            warn!(
                channel = entry.channel,
                function = function::name(entry.function),
                seq = entry.sequence,
                attempts = entry.transmissions,
                "command timed out"
            );
            self.faults.raise(FaultSeverity::Soft);
            let err = DeviceError::CommandTimeout {
                function: entry.function,
                channel: entry.channel,
                attempts: entry.transmissions,
            };
            entry.complete(Err(err));
        }

        summary
    }

    /// Record a fault. A fatal fault fails every outstanding command.
    pub fn raise_fault(&self, severity: FaultSeverity) {
        if self.faults.raise(severity) && severity == FaultSeverity::Fatal {
            error!("device marked fatally faulted");
            self.fail_outstanding(|| DeviceError::DeviceFault(FaultSeverity::Fatal));
        }
    }

    /// Forget all protocol state and clear faults (after a board reset).
    pub fn reset(&self) {
        let dropped = self.fail_outstanding(|| DeviceError::Reset);
        {
            let mut state = self.lock();
            state.next_sequence.clear();
            state.last_accepted.clear();
        }
        self.faults.clear();
        info!(dropped, "command engine reset");
    }

    fn fail_outstanding(&self, err: impl Fn() -> DeviceError) -> usize {
        let drained: Vec<Outstanding> = self.lock().outstanding.drain(..).collect();
        let count = drained.len();
        for entry in drained {
            bump(&self.counters.failed);
            entry.complete(Err(err()));
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn stats(&self) -> EngineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            submitted: load(&self.counters.submitted),
            completed: load(&self.counters.completed),
            retransmitted: load(&self.counters.retransmitted),
            timed_out: load(&self.counters.timed_out),
            failed: load(&self.counters.failed),
            duplicates: load(&self.counters.duplicates),
            unmatched: load(&self.counters.unmatched),
            acks_sent: load(&self.counters.acks_sent),
            indications: load(&self.counters.indications),
            malformed: load(&self.counters.malformed),
            outstanding: self.outstanding(),
        }
    }

    fn encode(&self, msg: &ControlMessage, token: Option<u64>) -> Result<Frame> {
        let mut buf = BytesMut::with_capacity(LINK_HEADER_SIZE + 64);
        encode_control(self.route, msg, &mut buf)?;
        let mut frame = Frame::outbound(buf)?;
        let tag = frame.tag_mut();
        tag.class = FrameClass::Control;
        tag.channel = Some(msg.channel);
        tag.token = token;
        Ok(frame)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CommandEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEngine")
            .field("config", &self.config)
            .field("outstanding", &self.outstanding())
            .field("fault", &self.faults.current())
            .finish()
    }
}
