use std::time::Duration;

use dsplink_frame::function;

use crate::channel::ChannelId;
use crate::fault::FaultSeverity;
use crate::format::CodecFormat;
use crate::registry::DeviceId;

fn function_name(code: &u16) -> &'static str {
    function::name(*code)
}

/// Errors that can occur in device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Frame encoding or decoding failed.
    #[error("frame error: {0}")]
    Frame(#[from] dsplink_frame::FrameError),

    /// Frame buffer construction failed.
    #[error("ring error: {0}")]
    Ring(#[from] dsplink_ring::RingError),

    /// No ack/response after every retransmission.
    #[error(
        "{} on channel {channel:#06x} timed out after {attempts} transmissions",
        function_name(.function)
    )]
    CommandTimeout {
        function: u16,
        channel: u16,
        attempts: u32,
    },

    /// The device is faulted; commands are refused until reset.
    #[error("device fault ({0})")]
    DeviceFault(FaultSeverity),

    /// The device answered with a non-zero status.
    #[error("device rejected {} with status {status}", function_name(.function))]
    Rejected { function: u16, status: u16 },

    /// A step of the channel build sequence failed. Partial state was rolled back.
    #[error("allocating channel {channel} failed at {step}: {source}")]
    Allocation {
        channel: ChannelId,
        step: &'static str,
        #[source]
        source: Box<DeviceError>,
    },

    /// The channel is already open.
    #[error("channel {0} is busy")]
    ChannelBusy(ChannelId),

    /// Unknown channel, or a handle that no longer refers to an open channel.
    #[error("channel {0} is not open")]
    InvalidChannel(ChannelId),

    /// Every channel able to do this conversion is in use.
    #[error("no free channel for {src} -> {dst}")]
    NoFreeChannel { src: CodecFormat, dst: CodecFormat },

    /// Conversions go between a linear or companded format and a compressed one.
    #[error("unsupported conversion {src} -> {dst}")]
    UnsupportedConversion { src: CodecFormat, dst: CodecFormat },

    /// Format name not recognised.
    #[error("unknown codec format '{0}'")]
    UnknownFormat(String),

    /// The caller's buffer cannot hold the next frame. The frame stays queued.
    #[error("buffer too small ({got} bytes, frame needs {needed})")]
    BufferTooSmall { needed: usize, got: usize },

    /// Non-blocking read found nothing queued.
    #[error("no payload ready")]
    WouldBlock,

    /// Timed read found nothing queued before the deadline.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The device was reset while the command was outstanding.
    #[error("device reset while command was outstanding")]
    Reset,

    /// No device with this id is registered.
    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),

    /// A device with this id is already registered.
    #[error("device {0} is already registered")]
    DuplicateDevice(DeviceId),

    /// The configuration cannot describe a working device.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Board reset or worker thread failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The command engine dropped the request without completing it.
    #[error("command engine shut down")]
    Shutdown,
}

impl DeviceError {
    /// True for errors that leave the device needing a reset.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::DeviceFault(_) | Self::CommandTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
