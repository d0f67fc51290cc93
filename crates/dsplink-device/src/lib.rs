//! Device-level management for DSP transcoders.
//!
//! This is the layer applications use. A [`Device`] owns the frame transport
//! of one board and runs three cooperating pieces on top of it:
//! - [`CommandEngine`]: reliable command/response exchange with retries
//! - [`ChannelManager`]: encoder/decoder pair allocation and recovery
//! - [`PayloadRouter`]: per-channel codec payload queues with flow control
//!
//! [`DeviceRegistry`] holds several boards; [`sim::Emulator`] stands in for
//! the firmware when no hardware is present.

pub mod channel;
pub mod command;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod fault;
pub mod format;
pub mod registry;
pub mod router;
pub mod sim;

pub use channel::{
    ChannelDirection, ChannelHandle, ChannelId, ChannelInfo, ChannelManager, ChannelState,
    ResetHandler,
};
pub use command::{Command, CommandFlags, Reply};
pub use config::{
    BootConfig, ChannelConfig, ClockConfig, DeviceConfig, EngineConfig, RouterConfig,
    TransportConfig,
};
pub use device::{
    BoardControl, Device, DeviceBuilder, DeviceStatistics, DeviceStatus, ServiceSummary,
};
pub use engine::{CommandEngine, ControlOutcome, EngineStats, PendingReply, SweepSummary};
pub use error::{DeviceError, Result};
pub use fault::{FaultMonitor, FaultSeverity};
pub use format::CodecFormat;
pub use registry::{DeviceId, DeviceRegistry};
pub use router::{
    Binding, CloseReason, Payload, PayloadRouter, ReadMode, RouterStats, WriteOutcome,
};
pub use sim::{Emulator, SimConfig, SimStats};
