//! One attached transcoder board.
//!
//! A [`Device`] owns the transport, command engine, payload router and
//! channel manager for one ring pair, plus the worker thread that drains
//! the rings. [`Device::service`] is the only place frames are taken off
//! the rings; it is serialized by a drain lock so the worker and explicit
//! callers never interleave.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use dsplink_frame::{function, CaptureTap, FrameSink, FrameTransport, PollSummary, TransportStats};
use dsplink_ring::{doorbell, Doorbell, DoorbellWaiter, Frame, FrameClass, RingPair, Wake};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, ChannelId, ChannelInfo, ChannelManager, ResetHandler};
use crate::command::Command;
use crate::config::{ClockConfig, DeviceConfig};
use crate::engine::{CommandEngine, ControlOutcome, EngineStats, SweepSummary};
use crate::error::{DeviceError, Result};
use crate::fault::{FaultMonitor, FaultSeverity};
use crate::format::CodecFormat;
use crate::router::{CloseReason, Payload, PayloadRouter, ReadMode, RouterStats, WriteOutcome};

/// Upper bound on back-to-back polls in one service call.
const MAX_DRAIN_PASSES: usize = 16;

/// Out-of-band board control (reset line).
pub trait BoardControl: Send + Sync {
    /// Hard-reset the board. Returns once the firmware accepts commands again.
    fn reset(&self) -> io::Result<()>;
}

/// What one [`Device::service`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    pub transmitted: usize,
    pub control: usize,
    pub payload: usize,
    pub malformed: usize,
    pub retransmitted: usize,
    pub expired: usize,
}

impl ServiceSummary {
    fn add_poll(&mut self, poll: PollSummary) {
        self.transmitted += poll.transmitted;
        self.control += poll.control;
        self.payload += poll.payload;
        self.malformed += poll.malformed;
    }

    fn add_sweep(&mut self, sweep: SweepSummary) {
        self.retransmitted += sweep.retransmitted;
        self.expired += sweep.expired;
    }
}

/// Counters reported by the firmware (GET_STATISTICS).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatistics {
    pub frames_received: u32,
    pub frames_sent: u32,
    pub active_channels: u16,
    pub load_percent: u16,
    pub alerts: u16,
}

impl DeviceStatistics {
    /// Decode the result words `[rx_hi, rx_lo, tx_hi, tx_lo, channels, load, alerts]`.
    pub fn from_results(words: &[u16]) -> Self {
        let word = |i: usize| words.get(i).copied().unwrap_or(0);
        let long = |i: usize| (u32::from(word(i)) << 16) | u32::from(word(i + 1));
        Self {
            frames_received: long(0),
            frames_sent: long(2),
            active_channels: word(4),
            load_percent: word(5),
            alerts: word(6),
        }
    }
}

/// Host-side view of a device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub fault: Option<FaultSeverity>,
    pub alerts: u64,
    pub last_alert: Option<u16>,
    pub channels: Vec<ChannelInfo>,
    pub engine: EngineStats,
    pub router: RouterStats,
    pub transport: TransportStats,
}

struct Dispatch<'a> {
    engine: &'a CommandEngine,
    router: &'a PayloadRouter,
}

impl FrameSink for Dispatch<'_> {
    fn on_transmitted(&mut self, frame: Frame) {
        if frame.tag().class == FrameClass::Control {
            self.engine.on_transmitted(frame);
        }
    }

    fn on_control(&mut self, frame: Frame) {
        if self.engine.on_control(frame) == ControlOutcome::Alert(FaultSeverity::Fatal) {
            self.router.close_all(CloseReason::Faulted);
        }
    }

    fn on_payload(&mut self, frame: Frame) {
        self.router.on_payload_frame(frame);
    }
}

/// The parts shared with the worker thread and the channel manager.
struct DeviceCore {
    name: String,
    config: DeviceConfig,
    transport: Arc<FrameTransport>,
    engine: Arc<CommandEngine>,
    router: Arc<PayloadRouter>,
    board: Arc<dyn BoardControl>,
    drain: Mutex<()>,
}

impl DeviceCore {
    fn service(&self) -> ServiceSummary {
        let _drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dispatch = Dispatch {
            engine: &self.engine,
            router: &self.router,
        };
        let mut summary = ServiceSummary::default();

        for _ in 0..MAX_DRAIN_PASSES {
            let poll = self.transport.poll(&mut dispatch);
            summary.add_poll(poll);
            if poll.is_idle() {
                break;
            }
        }

        let sweep = self.engine.sweep(Instant::now());
        summary.add_sweep(sweep);
        if sweep.repoll {
            summary.add_poll(self.transport.poll(&mut dispatch));
        }
        summary
    }

    fn boot(&self) -> Result<()> {
        let link = self.config.transport.link();
        for cmd in Command::boot_sequence(&self.config.boot, &link) {
            self.engine.call(&cmd)?.check(cmd.function())?;
        }
        info!(device = %self.name, "device booted");
        Ok(())
    }
}

impl ResetHandler for DeviceCore {
    fn full_reset(&self) -> Result<()> {
        info!(device = %self.name, "resetting device");
        self.board.reset()?;
        let dropped = {
            let _drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
            self.transport.reset()
        };
        self.engine.reset();
        self.router.close_all(CloseReason::Released);
        let posted = self.transport.prime();
        debug!(device = %self.name, dropped, rx_buffers = posted, "rings reset");
        self.boot()
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<DoorbellWaiter>,
}

fn run_worker(core: Arc<DeviceCore>, waiter: DoorbellWaiter, stop: Arc<AtomicBool>) -> DoorbellWaiter {
    let period = core.config.engine.watchdog_period;
    debug!(device = %core.name, ?period, "service worker started");
    while !stop.load(Ordering::Acquire) {
        if waiter.wait(period) == Wake::Closed {
            break;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        core.service();
    }
    debug!(device = %core.name, "service worker stopped");
    waiter
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    name: String,
    config: DeviceConfig,
    rings: RingPair,
    board: Arc<dyn BoardControl>,
    capture: Option<Arc<dyn CaptureTap>>,
}

impl DeviceBuilder {
    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Mirror control traffic to `tap`.
    pub fn with_capture(mut self, tap: Arc<dyn CaptureTap>) -> Self {
        self.capture = Some(tap);
        self
    }

    /// Wire everything to the rings and post receive buffers. Does not boot.
    pub fn attach(self) -> Result<Device> {
        let Self {
            name,
            config,
            rings,
            board,
            capture,
        } = self;
        if config.channels.pairs == 0 {
            return Err(DeviceError::InvalidConfig(
                "device needs at least one channel pair".to_string(),
            ));
        }

        let (bell, waiter) = doorbell();
        rings.tx.connect_host(bell.clone());
        rings.rx.connect_host(bell.clone());

        let mut transport = FrameTransport::new(rings);
        if let Some(tap) = capture {
            transport = transport.with_capture(tap);
        }
        let transport = Arc::new(transport);

        let link = config.transport.link();
        let engine = Arc::new(CommandEngine::new(
            transport.clone(),
            link.to_device(),
            config.engine.clone(),
            Arc::new(FaultMonitor::new()),
            bell.clone(),
        ));
        let router = Arc::new(PayloadRouter::new(
            transport.clone(),
            link.to_device(),
            config.router.clone(),
            usize::from(config.channels.pairs) * 2,
        ));
        let core = Arc::new(DeviceCore {
            name: name.clone(),
            config: config.clone(),
            transport: transport.clone(),
            engine: engine.clone(),
            router: router.clone(),
            board,
            drain: Mutex::new(()),
        });
        let channels = ChannelManager::new(engine, router, core.clone(), config.channels.clone());

        let posted = transport.prime();
        info!(
            device = %name,
            pairs = config.channels.pairs,
            rx_buffers = posted,
            "device attached"
        );
        Ok(Device {
            core,
            channels,
            bell,
            waiter: Mutex::new(Some(waiter)),
            worker: Mutex::new(None),
        })
    }
}

pub struct Device {
    core: Arc<DeviceCore>,
    channels: ChannelManager,
    bell: Doorbell,
    waiter: Mutex<Option<DoorbellWaiter>>,
    worker: Mutex<Option<Worker>>,
}

impl Device {
    pub fn builder(name: impl Into<String>, rings: RingPair, board: Arc<dyn BoardControl>) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            config: DeviceConfig::default(),
            rings,
            board,
            capture: None,
        }
    }

    /// Attach with `config` and no capture tap.
    pub fn attach(
        name: impl Into<String>,
        config: DeviceConfig,
        rings: RingPair,
        board: Arc<dyn BoardControl>,
    ) -> Result<Self> {
        Self::builder(name, rings, board).with_config(config).attach()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.core.config
    }

    pub fn engine(&self) -> &CommandEngine {
        &self.core.engine
    }

    pub fn router(&self) -> &PayloadRouter {
        &self.core.router
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn transport(&self) -> &FrameTransport {
        &self.core.transport
    }

    /// Spawn the service worker. No-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        let waiter = lock(&self.waiter)
            .take()
            .ok_or(DeviceError::Shutdown)?;
        let core = self.core.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("dsplink-{}", self.core.name))
            .spawn(move || run_worker(core, waiter, flag))?;
        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stop and join the service worker.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        self.bell.ring();
        match worker.handle.join() {
            Ok(waiter) => *lock(&self.waiter) = Some(waiter),
            Err(_) => warn!(device = %self.core.name, "service worker panicked"),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Drain both rings, dispatch what came back and run the watchdog sweep.
    pub fn service(&self) -> ServiceSummary {
        self.core.service()
    }

    /// Device-wide setup. Needs the worker running.
    pub fn boot(&self) -> Result<()> {
        self.core.boot()
    }

    /// Reset the board, drop every channel and boot again.
    pub fn reset(&self) -> Result<()> {
        self.channels.reset()
    }

    /// Open a free channel converting `src` into `dst`.
    pub fn open(&self, src: CodecFormat, dst: CodecFormat) -> Result<ChannelHandle> {
        self.channels.open_any(src, dst)
    }

    /// Open a specific channel.
    pub fn open_channel(&self, channel: ChannelId, src: CodecFormat, dst: CodecFormat) -> Result<ChannelHandle> {
        self.channels.open(channel, src, dst)
    }

    /// Build a channel's pair without opening it.
    pub fn allocate(&self, channel: ChannelId, src: CodecFormat, dst: CodecFormat) -> Result<()> {
        self.channels.allocate(channel, src, dst)
    }

    pub fn write(&self, handle: &ChannelHandle, data: &[u8]) -> Result<WriteOutcome> {
        self.core.router.enqueue_outbound(handle, data)
    }

    pub fn read(&self, handle: &ChannelHandle, mode: ReadMode) -> Result<Payload> {
        self.core.router.read(handle, mode)
    }

    pub fn read_into(&self, handle: &ChannelHandle, buf: &mut [u8], mode: ReadMode) -> Result<usize> {
        self.core.router.read_into(handle, buf, mode)
    }

    pub fn close(&self, handle: ChannelHandle) -> Result<()> {
        self.channels.release(handle)
    }

    /// Round trip of a PING command.
    pub fn ping(&self) -> Result<std::time::Duration> {
        let started = Instant::now();
        self.core.engine.call(&Command::ping())?.check(function::PING)?;
        Ok(started.elapsed())
    }

    pub fn set_clock(&self, clock: ClockConfig) -> Result<()> {
        self.core.engine.call(&Command::set_clock(clock))?;
        Ok(())
    }

    pub fn statistics(&self) -> Result<DeviceStatistics> {
        let reply = self
            .core
            .engine
            .call(&Command::get_statistics())?
            .check(function::GET_STATISTICS)?;
        Ok(DeviceStatistics::from_results(reply.results()))
    }

    pub fn status(&self) -> DeviceStatus {
        let faults = self.core.engine.faults();
        DeviceStatus {
            name: self.core.name.clone(),
            fault: faults.current(),
            alerts: faults.alerts(),
            last_alert: faults.last_alert(),
            channels: self.channels.snapshot(),
            engine: self.core.engine.stats(),
            router: self.core.router.stats(),
            transport: self.core.transport.stats(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.core.name)
            .field("engine", &self.core.engine)
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_decode_split_counters() {
        let stats = DeviceStatistics::from_results(&[0x0001, 0x0002, 0, 9, 4, 37, 1]);
        assert_eq!(stats.frames_received, 0x0001_0002);
        assert_eq!(stats.frames_sent, 9);
        assert_eq!(stats.active_channels, 4);
        assert_eq!(stats.load_percent, 37);
        assert_eq!(stats.alerts, 1);
    }

    #[test]
    fn statistics_tolerate_short_replies() {
        let stats = DeviceStatistics::from_results(&[0, 5]);
        assert_eq!(stats.frames_received, 5);
        assert_eq!(stats, DeviceStatistics { frames_received: 5, ..DeviceStatistics::default() });
    }

    #[test]
    fn summary_accumulates() {
        let mut summary = ServiceSummary::default();
        summary.add_poll(PollSummary {
            transmitted: 2,
            control: 1,
            payload: 3,
            malformed: 0,
            flushed: 1,
        });
        summary.add_sweep(SweepSummary {
            retransmitted: 1,
            expired: 0,
            repoll: false,
        });
        assert_eq!(summary.transmitted, 2);
        assert_eq!(summary.payload, 3);
        assert_eq!(summary.retransmitted, 1);
    }
}
