//! Host-side driver for DMA-attached DSP transcoders.
//!
//! # Crate Structure
//!
//! - [`ring`]: DMA frame rings and the doorbell between host and device
//! - [`frame`]: link/control/payload wire codec and the frame transport
//! - [`device`]: command engine, channel manager, payload router, devices

/// Re-export ring types.
pub mod ring {
    pub use dsplink_ring::*;
}

/// Re-export frame types.
pub mod frame {
    pub use dsplink_frame::*;
}

/// Re-export device types.
pub mod device {
    pub use dsplink_device::*;
}

pub use dsplink_device::{
    ChannelHandle, CodecFormat, Device, DeviceConfig, DeviceError, DeviceRegistry, ReadMode,
};
