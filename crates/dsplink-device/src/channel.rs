//! Logical channel lifecycle.
//!
//! Channels come in pairs: encoder `i` (linear → compressed) and decoder `i`
//! (compressed → linear) share two device channels created on timeslots
//! `2i` and `2i + 1` and connected to each other. Opening either half builds
//! the pair; closing the last open half tears it down.
//!
//! All state changes happen under one allocation lock, held for the whole
//! create/configure/connect sequence. A second caller asking for the same
//! pair blocks on that lock and then finds the pair built.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dsplink_frame::function;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::ChannelConfig;
use crate::engine::CommandEngine;
use crate::error::{DeviceError, Result};
use crate::fault::FaultSeverity;
use crate::format::CodecFormat;
use crate::router::{Binding, CloseReason, PayloadRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelDirection {
    Encoder,
    Decoder,
}

impl ChannelDirection {
    /// Direction needed for a `src` → `dst` conversion.
    pub fn for_conversion(src: CodecFormat, dst: CodecFormat) -> Result<Self> {
        CodecFormat::check_conversion(src, dst)?;
        Ok(if dst.is_compressed() {
            Self::Encoder
        } else {
            Self::Decoder
        })
    }

    fn slot(self) -> usize {
        match self {
            Self::Encoder => 0,
            Self::Decoder => 1,
        }
    }
}

/// Logical channel number. Encoder `i` is `2i`, decoder `i` is `2i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u16);

impl ChannelId {
    pub const fn new(pair: u16, direction: ChannelDirection) -> Self {
        match direction {
            ChannelDirection::Encoder => Self(pair * 2),
            ChannelDirection::Decoder => Self(pair * 2 + 1),
        }
    }

    pub const fn from_index(index: u16) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u16 {
        self.0
    }

    pub const fn pair(self) -> u16 {
        self.0 / 2
    }

    pub const fn direction(self) -> ChannelDirection {
        if self.0 % 2 == 0 {
            ChannelDirection::Encoder
        } else {
            ChannelDirection::Decoder
        }
    }

    /// The other half of the pair.
    pub const fn complement(self) -> Self {
        Self(self.0 ^ 1)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction() {
            ChannelDirection::Encoder => write!(f, "enc{}", self.pair()),
            ChannelDirection::Decoder => write!(f, "dec{}", self.pair()),
        }
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// No device channels exist for the pair.
    Unbuilt,
    /// The pair is built and this half is free.
    Built,
    /// A consumer has this half open.
    Busy,
}

/// An open channel. Stale after close or after a device reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub channel: ChannelId,
    pub generation: u32,
}

/// One row of [`ChannelManager::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub channel: ChannelId,
    pub state: ChannelState,
    /// Device channel this half writes to.
    pub device_channel: Option<u16>,
    pub src: Option<CodecFormat>,
    pub dst: Option<CodecFormat>,
}

/// Performs a full board reset and device boot.
pub trait ResetHandler: Send + Sync {
    fn full_reset(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    Unbuilt,
    Built {
        /// Device channel carrying the linear side.
        encoder: u16,
        /// Device channel carrying the compressed side.
        decoder: u16,
        linear: CodecFormat,
        compressed: CodecFormat,
    },
}

#[derive(Debug)]
struct Pair {
    index: u16,
    state: PairState,
    busy: [bool; 2],
    generation: [u32; 2],
}

impl Pair {
    fn new(index: u16) -> Self {
        Self {
            index,
            state: PairState::Unbuilt,
            busy: [false; 2],
            generation: [0; 2],
        }
    }

    fn timeslots(&self) -> (u16, u16) {
        (self.index * 2, self.index * 2 + 1)
    }

    fn is_idle(&self) -> bool {
        !self.busy[0] && !self.busy[1]
    }

    fn built_for(&self, linear: CodecFormat, compressed: CodecFormat) -> bool {
        matches!(
            self.state,
            PairState::Built { linear: l, compressed: c, .. } if l == linear && c == compressed
        )
    }

    fn info(&self, direction: ChannelDirection) -> ChannelInfo {
        let channel = ChannelId::new(self.index, direction);
        match self.state {
            PairState::Unbuilt => ChannelInfo {
                channel,
                state: ChannelState::Unbuilt,
                device_channel: None,
                src: None,
                dst: None,
            },
            PairState::Built {
                encoder,
                decoder,
                linear,
                compressed,
            } => {
                let state = if self.busy[direction.slot()] {
                    ChannelState::Busy
                } else {
                    ChannelState::Built
                };
                let (device_channel, src, dst) = match direction {
                    ChannelDirection::Encoder => (encoder, linear, compressed),
                    ChannelDirection::Decoder => (decoder, compressed, linear),
                };
                ChannelInfo {
                    channel,
                    state,
                    device_channel: Some(device_channel),
                    src: Some(src),
                    dst: Some(dst),
                }
            }
        }
    }
}

struct Allocation {
    pairs: Vec<Pair>,
    /// Fatal-fault epoch whose invalidation already ran.
    fatal_epoch: u64,
}

/// Builds, hands out and tears down channel pairs on one device.
pub struct ChannelManager {
    engine: Arc<CommandEngine>,
    router: Arc<PayloadRouter>,
    resetter: Arc<dyn ResetHandler>,
    config: ChannelConfig,
    alloc: Mutex<Allocation>,
}

impl ChannelManager {
    pub fn new(
        engine: Arc<CommandEngine>,
        router: Arc<PayloadRouter>,
        resetter: Arc<dyn ResetHandler>,
        config: ChannelConfig,
    ) -> Self {
        let pairs = (0..config.pairs).map(Pair::new).collect();
        let fatal_epoch = engine.faults().fatal_epoch();
        Self {
            engine,
            router,
            resetter,
            config,
            alloc: Mutex::new(Allocation { pairs, fatal_epoch }),
        }
    }

    /// Number of logical channels (two per pair).
    pub fn channel_count(&self) -> usize {
        usize::from(self.config.pairs) * 2
    }

    pub fn state(&self, channel: ChannelId) -> Result<ChannelState> {
        let alloc = self.lock();
        let pair = pair_of(&alloc.pairs, channel)?;
        Ok(pair.info(channel.direction()).state)
    }

    pub fn snapshot(&self) -> Vec<ChannelInfo> {
        let alloc = self.lock();
        alloc
            .pairs
            .iter()
            .flat_map(|p| [p.info(ChannelDirection::Encoder), p.info(ChannelDirection::Decoder)])
            .collect()
    }

    /// Pick a free channel for `src` → `dst`, preferring pairs already built
    /// for these formats. Does not reserve it.
    pub fn find_free(&self, src: CodecFormat, dst: CodecFormat) -> Result<ChannelId> {
        let alloc = self.lock();
        find_free_in(&alloc.pairs, src, dst)
    }

    /// Build the pair behind `channel` for `src` → `dst`. No wire traffic
    /// when it is already built for these formats.
    pub fn allocate(&self, channel: ChannelId, src: CodecFormat, dst: CodecFormat) -> Result<()> {
        let (linear, compressed) = pair_formats(channel, src, dst)?;
        let mut alloc = self.lock();
        self.reconcile_faults(&mut alloc)?;
        let pair = pair_of_mut(&mut alloc.pairs, channel)?;
        self.build(pair, channel, linear, compressed)
    }

    /// Allocate `channel` if needed and mark it busy.
    pub fn open(&self, channel: ChannelId, src: CodecFormat, dst: CodecFormat) -> Result<ChannelHandle> {
        let (linear, compressed) = pair_formats(channel, src, dst)?;
        let mut alloc = self.lock();
        self.reconcile_faults(&mut alloc)?;
        self.open_locked(&mut alloc, channel, linear, compressed)
    }

    /// Open any free channel able to do `src` → `dst`.
    pub fn open_any(&self, src: CodecFormat, dst: CodecFormat) -> Result<ChannelHandle> {
        let mut alloc = self.lock();
        self.reconcile_faults(&mut alloc)?;
        let channel = find_free_in(&alloc.pairs, src, dst)?;
        let (linear, compressed) = pair_formats(channel, src, dst)?;
        self.open_locked(&mut alloc, channel, linear, compressed)
    }

    /// Close an open channel. The pair is torn down once neither half is open.
    pub fn release(&self, handle: ChannelHandle) -> Result<()> {
        let channel = handle.channel;
        let mut alloc = self.lock();
        self.sync_fatal(&mut alloc);
        let pair = pair_of_mut(&mut alloc.pairs, channel)?;
        let slot = channel.direction().slot();
        if !pair.busy[slot] || pair.generation[slot] != handle.generation {
            return Err(DeviceError::InvalidChannel(channel));
        }
        pair.busy[slot] = false;
        self.router.unbind(channel);
        info!(%channel, "channel closed");

        if pair.busy[slot ^ 1] {
            return Ok(());
        }
        self.teardown(pair)
            .map_err(|err| allocation_error(channel, "teardown", err))
    }

    /// Reset the board and forget every channel.
    pub fn reset(&self) -> Result<()> {
        let mut alloc = self.lock();
        self.reset_locked(&mut alloc)
    }

    fn open_locked(
        &self,
        alloc: &mut Allocation,
        channel: ChannelId,
        linear: CodecFormat,
        compressed: CodecFormat,
    ) -> Result<ChannelHandle> {
        let pair = pair_of_mut(&mut alloc.pairs, channel)?;
        let slot = channel.direction().slot();
        if pair.busy[slot] {
            return Err(DeviceError::ChannelBusy(channel));
        }
        self.build(pair, channel, linear, compressed)?;

        let PairState::Built { encoder, decoder, .. } = pair.state else {
            return Err(DeviceError::InvalidChannel(channel));
        };
        pair.busy[slot] = true;
        pair.generation[slot] = pair.generation[slot].wrapping_add(1);
        let generation = pair.generation[slot];

        let binding = match channel.direction() {
            ChannelDirection::Encoder => Binding {
                tx: encoder,
                rx: decoder,
                src: linear,
                dst: compressed,
                generation,
            },
            ChannelDirection::Decoder => Binding {
                tx: decoder,
                rx: encoder,
                src: compressed,
                dst: linear,
                generation,
            },
        };
        self.router.bind(channel, binding);
        info!(%channel, tx = binding.tx, rx = binding.rx, "channel opened");
        Ok(ChannelHandle {
            channel,
            generation,
        })
    }

    fn build(
        &self,
        pair: &mut Pair,
        channel: ChannelId,
        linear: CodecFormat,
        compressed: CodecFormat,
    ) -> Result<()> {
        match pair.state {
            PairState::Built { .. } if pair.built_for(linear, compressed) => {
                debug!(%channel, "pair already built");
                return Ok(());
            }
            PairState::Built { .. } => {
                if !pair.is_idle() {
                    return Err(DeviceError::ChannelBusy(channel.complement()));
                }
                self.teardown(pair)
                    .map_err(|err| allocation_error(channel, "teardown before rebuild", err))?;
            }
            PairState::Unbuilt => {}
        }

        let (slot_a, slot_b) = pair.timeslots();
        let encoder = self
            .create(slot_a)
            .map_err(|err| allocation_error(channel, "create encoder channel", err))?;
        let decoder = match self.create(slot_b) {
            Ok(number) => number,
            Err(err) => {
                self.roll_back(&[encoder]);
                return Err(allocation_error(channel, "create decoder channel", err));
            }
        };

        if let Err((step, err)) = self.connect(encoder, decoder, (slot_a, slot_b), linear, compressed) {
            self.roll_back(&[encoder, decoder]);
            return Err(allocation_error(channel, step, err));
        }

        pair.state = PairState::Built {
            encoder,
            decoder,
            linear,
            compressed,
        };
        info!(
            pair = pair.index,
            encoder,
            decoder,
            %linear,
            %compressed,
            "channel pair built"
        );
        debug!(complement = %channel.complement(), "complement ready");
        Ok(())
    }

    fn create(&self, timeslot: u16) -> Result<u16> {
        let reply = self
            .engine
            .call(&Command::create_channel(timeslot))?
            .check(function::CREATE_CHANNEL)?;
        reply
            .results()
            .first()
            .copied()
            .ok_or(DeviceError::Rejected {
                function: function::CREATE_CHANNEL,
                status: u16::MAX,
            })
    }

    fn connect(
        &self,
        encoder: u16,
        decoder: u16,
        (slot_a, slot_b): (u16, u16),
        linear: CodecFormat,
        compressed: CodecFormat,
    ) -> std::result::Result<(), (&'static str, DeviceError)> {
        let port = |slot: u16| self.config.base_port.wrapping_add(slot);
        for cmd in Command::configure_channel(encoder, port(slot_a), linear, &self.config) {
            self.engine
                .call(&cmd)
                .map_err(|err| ("configure encoder channel", err))?;
        }
        for cmd in Command::configure_channel(decoder, port(slot_b), compressed, &self.config) {
            self.engine
                .call(&cmd)
                .map_err(|err| ("configure decoder channel", err))?;
        }
        self.engine
            .call(&Command::connect(encoder, decoder, linear, compressed))
            .and_then(|reply| reply.check(function::CONNECT))
            .map_err(|err| ("connect", err))?;
        Ok(())
    }

    /// Disconnect and destroy a built pair. Stops at the first failed step;
    /// the device channels left behind are reclaimed by the reset that the
    /// raised soft fault schedules.
    fn teardown(&self, pair: &mut Pair) -> Result<()> {
        let PairState::Built { encoder, decoder, .. } = pair.state else {
            return Ok(());
        };
        pair.state = PairState::Unbuilt;

        let steps = [
            Command::disconnect(encoder, decoder),
            Command::destroy_channel(encoder),
            Command::destroy_channel(decoder),
        ];
        for cmd in &steps {
            let result = self
                .engine
                .call(cmd)
                .and_then(|reply| reply.check(cmd.function()));
            if let Err(err) = result {
                warn!(
                    pair = pair.index,
                    encoder,
                    decoder,
                    function = cmd.function(),
                    error = %err,
                    "pair teardown failed, device reset pending"
                );
                self.engine.raise_fault(FaultSeverity::Soft);
                return Err(err);
            }
        }
        info!(pair = pair.index, encoder, decoder, "channel pair torn down");
        Ok(())
    }

    fn roll_back(&self, numbers: &[u16]) {
        for &number in numbers {
            let result = self
                .engine
                .call(&Command::destroy_channel(number))
                .and_then(|reply| reply.check(function::DESTROY_CHANNEL));
            if let Err(err) = result {
                warn!(number, error = %err, "rollback destroy failed, device reset pending");
                self.engine.raise_fault(FaultSeverity::Soft);
            }
        }
    }

    /// Invalidate channel state once per fatal fault.
    fn sync_fatal(&self, alloc: &mut Allocation) {
        let epoch = self.engine.faults().fatal_epoch();
        if epoch != alloc.fatal_epoch {
            alloc.fatal_epoch = epoch;
            warn!("fatal fault, invalidating every channel");
            self.invalidate(alloc, CloseReason::Faulted);
        }
    }

    fn reconcile_faults(&self, alloc: &mut Allocation) -> Result<()> {
        self.sync_fatal(alloc);
        match self.engine.faults().current() {
            None => Ok(()),
            Some(FaultSeverity::Fatal) if self.config.auto_reset => self.reset_locked(alloc),
            Some(FaultSeverity::Fatal) => Err(DeviceError::DeviceFault(FaultSeverity::Fatal)),
            Some(FaultSeverity::Soft) => {
                if alloc.pairs.iter().all(Pair::is_idle) {
                    info!("soft fault pending and no channel busy, resetting");
                    self.reset_locked(alloc)
                } else {
                    debug!("soft fault pending, channels busy, deferring reset");
                    Ok(())
                }
            }
        }
    }

    fn reset_locked(&self, alloc: &mut Allocation) -> Result<()> {
        self.invalidate(alloc, CloseReason::Released);
        self.resetter.full_reset()?;
        alloc.fatal_epoch = self.engine.faults().fatal_epoch();
        Ok(())
    }

    fn invalidate(&self, alloc: &mut Allocation, reason: CloseReason) {
        for pair in &mut alloc.pairs {
            pair.state = PairState::Unbuilt;
            pair.busy = [false; 2];
            for generation in &mut pair.generation {
                *generation = generation.wrapping_add(1);
            }
        }
        self.router.close_all(reason);
    }

    fn lock(&self) -> MutexGuard<'_, Allocation> {
        self.alloc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn allocation_error(channel: ChannelId, step: &'static str, source: DeviceError) -> DeviceError {
    DeviceError::Allocation {
        channel,
        step,
        source: Box::new(source),
    }
}

/// `(linear, compressed)` formats of the pair serving `channel` for `src` → `dst`.
fn pair_formats(
    channel: ChannelId,
    src: CodecFormat,
    dst: CodecFormat,
) -> Result<(CodecFormat, CodecFormat)> {
    let direction = ChannelDirection::for_conversion(src, dst)?;
    if direction != channel.direction() {
        return Err(DeviceError::UnsupportedConversion { src, dst });
    }
    Ok(match direction {
        ChannelDirection::Encoder => (src, dst),
        ChannelDirection::Decoder => (dst, src),
    })
}

fn pair_of(pairs: &[Pair], channel: ChannelId) -> Result<&Pair> {
    pairs
        .get(usize::from(channel.pair()))
        .ok_or(DeviceError::InvalidChannel(channel))
}

fn pair_of_mut(pairs: &mut [Pair], channel: ChannelId) -> Result<&mut Pair> {
    pairs
        .get_mut(usize::from(channel.pair()))
        .ok_or(DeviceError::InvalidChannel(channel))
}

fn find_free_in(pairs: &[Pair], src: CodecFormat, dst: CodecFormat) -> Result<ChannelId> {
    let direction = ChannelDirection::for_conversion(src, dst)?;
    let (linear, compressed) = match direction {
        ChannelDirection::Encoder => (src, dst),
        ChannelDirection::Decoder => (dst, src),
    };
    let slot = direction.slot();
    let free = |p: &&Pair| !p.busy[slot];

    pairs
        .iter()
        .filter(free)
        .find(|p| p.built_for(linear, compressed))
        .or_else(|| pairs.iter().filter(free).find(|p| p.state == PairState::Unbuilt))
        .or_else(|| pairs.iter().find(|p| p.is_idle()))
        .map(|p| ChannelId::new(p.index, direction))
        .ok_or(DeviceError::NoFreeChannel { src, dst })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_pair_up() {
        let enc = ChannelId::new(3, ChannelDirection::Encoder);
        let dec = ChannelId::new(3, ChannelDirection::Decoder);
        assert_eq!(enc.index(), 6);
        assert_eq!(dec.index(), 7);
        assert_eq!(enc.complement(), dec);
        assert_eq!(dec.complement(), enc);
        assert_eq!(dec.pair(), 3);
        assert_eq!(enc.to_string(), "enc3");
        assert_eq!(dec.to_string(), "dec3");
        assert_eq!(ChannelId::from_index(7), dec);
    }

    #[test]
    fn direction_follows_conversion() {
        assert_eq!(
            ChannelDirection::for_conversion(CodecFormat::Ulaw, CodecFormat::G729a).unwrap(),
            ChannelDirection::Encoder
        );
        assert_eq!(
            ChannelDirection::for_conversion(CodecFormat::G723, CodecFormat::Slin).unwrap(),
            ChannelDirection::Decoder
        );
        assert!(ChannelDirection::for_conversion(CodecFormat::Ulaw, CodecFormat::Slin).is_err());
    }

    #[test]
    fn pair_formats_reject_wrong_half() {
        let dec = ChannelId::new(0, ChannelDirection::Decoder);
        assert_eq!(
            pair_formats(dec, CodecFormat::G729a, CodecFormat::Ulaw).unwrap(),
            (CodecFormat::Ulaw, CodecFormat::G729a)
        );
        assert!(matches!(
            pair_formats(dec, CodecFormat::Ulaw, CodecFormat::G729a),
            Err(DeviceError::UnsupportedConversion { .. })
        ));
    }

    fn built(index: u16, busy: [bool; 2]) -> Pair {
        Pair {
            index,
            state: PairState::Built {
                encoder: index * 2,
                decoder: index * 2 + 1,
                linear: CodecFormat::Ulaw,
                compressed: CodecFormat::G729a,
            },
            busy,
            generation: [1; 2],
        }
    }

    #[test]
    fn find_free_prefers_built_pairs() {
        let pairs = vec![Pair::new(0), built(1, [true, false]), Pair::new(2)];
        let found = find_free_in(&pairs, CodecFormat::G729a, CodecFormat::Ulaw).unwrap();
        assert_eq!(found, ChannelId::new(1, ChannelDirection::Decoder));

        // Encoder half of pair 1 is busy, so fall back to an unbuilt pair.
        let found = find_free_in(&pairs, CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
        assert_eq!(found, ChannelId::new(0, ChannelDirection::Encoder));
    }

    #[test]
    fn find_free_reports_exhaustion() {
        let pairs = vec![built(0, [true, true])];
        assert!(matches!(
            find_free_in(&pairs, CodecFormat::Ulaw, CodecFormat::G729a),
            Err(DeviceError::NoFreeChannel { .. })
        ));
    }

    #[test]
    fn find_free_rebuilds_idle_pair_with_other_formats() {
        let pairs = vec![built(0, [false, false])];
        let found = find_free_in(&pairs, CodecFormat::Alaw, CodecFormat::G723).unwrap();
        assert_eq!(found, ChannelId::new(0, ChannelDirection::Encoder));
    }

    #[test]
    fn pair_info_reports_each_half() {
        let pair = built(2, [false, true]);
        let enc = pair.info(ChannelDirection::Encoder);
        let dec = pair.info(ChannelDirection::Decoder);
        assert_eq!(enc.state, ChannelState::Built);
        assert_eq!(dec.state, ChannelState::Busy);
        assert_eq!(enc.device_channel, Some(4));
        assert_eq!(dec.device_channel, Some(5));
        assert_eq!(dec.src, Some(CodecFormat::G729a));
        assert_eq!(dec.dst, Some(CodecFormat::Ulaw));
        assert_eq!(Pair::new(0).info(ChannelDirection::Encoder).state, ChannelState::Unbuilt);
    }
}
