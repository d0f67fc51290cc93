//! DMA frame rings shared between the host and a transcoder device.
//!
//! This is the lowest layer of dsplink. A device exposes two rings of frame
//! slots (submit and receive); ownership of each slot alternates between the
//! host and the device. Everything else builds on the [`FrameRing`] and
//! [`Frame`] types provided here.

pub mod doorbell;
pub mod error;
pub mod frame;
pub mod ring;

pub use doorbell::{doorbell, Doorbell, DoorbellWaiter, Wake};
pub use error::{Result, RingError, SubmitError};
pub use frame::{Direction, Frame, FrameClass, FrameId, FrameTag, MAX_FRAME_SIZE};
pub use ring::{FrameRing, RingConfig, RingPair, RingStats, DEFAULT_RING_CAPACITY};
