//! Wire codec and frame transport for the transcoder link.
//!
//! Every frame starts with a 14-byte link header whose ethertype separates
//! the two kinds of traffic:
//! - control frames: sequence, control bits, channel, then sub-commands
//! - payload frames: channel, sequence, timestamp, format, then codec bytes
//!
//! [`FrameTransport`] turns the two DMA rings into send/poll operations.

pub mod channel;
pub mod codec;
pub mod error;
pub mod transport;

pub use channel::{
    channel_name, class, function, is_supervisor, kind, ControlFlags, ETHERTYPE_CONTROL,
    ETHERTYPE_PAYLOAD, SUPERVISOR,
};
pub use codec::{
    classify, decode_control, decode_link, decode_payload, encode_control, encode_payload,
    ControlMessage, LinkAddrs, LinkHeader, MacAddr, PayloadHeader, Route, SubCommand,
    LINK_HEADER_SIZE, MAX_PARAMS, MAX_PAYLOAD_SIZE, PAYLOAD_HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use transport::{CaptureTap, FrameSink, FrameTransport, PollSummary, TransportStats};
