use std::fmt;

use bytes::{BufMut, BytesMut};
use dsplink_ring::{FrameClass, MAX_FRAME_SIZE};

use crate::channel::{ControlFlags, ETHERTYPE_CONTROL, ETHERTYPE_PAYLOAD};
use crate::error::{FrameError, Result};

/// Link header: destination (6) + source (6) + ethertype (2) = 14 bytes.
pub const LINK_HEADER_SIZE: usize = 14;

/// Control header: sequence (1) + control (1) + channel (2).
pub const CONTROL_HEADER_SIZE: usize = 4;

/// Sub-command header: length, index, type, class (1 each) + function (2).
pub const SUBCOMMAND_HEADER_SIZE: usize = 6;

/// Largest parameter list a one-byte sub-command length can describe.
pub const MAX_PARAMS: usize = (u8::MAX as usize - SUBCOMMAND_HEADER_SIZE) / 2;

/// Payload header: channel (2) + sequence (2) + timestamp (4) + format (1) + flags (1).
pub const PAYLOAD_HEADER_SIZE: usize = 10;

/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - LINK_HEADER_SIZE - PAYLOAD_HEADER_SIZE;

/// Six-byte link address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Source and destination of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dst: MacAddr,
    pub src: MacAddr,
}

/// Host and device link addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddrs {
    pub host: MacAddr,
    pub device: MacAddr,
}

impl LinkAddrs {
    pub fn to_device(&self) -> Route {
        Route {
            dst: self.device,
            src: self.host,
        }
    }

    pub fn to_host(&self) -> Route {
        Route {
            dst: self.host,
            src: self.device,
        }
    }
}

impl Default for LinkAddrs {
    fn default() -> Self {
        Self {
            host: MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            device: MacAddr([0x00, 0xff, 0xff, 0xff, 0xff, 0x01]),
        }
    }
}

/// Decoded link header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader {
    pub route: Route,
    pub ethertype: u16,
}

/// One sub-command of a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubCommand {
    pub index: u8,
    /// Sub-command type (see [`crate::channel::kind`]).
    pub kind: u8,
    pub class: u8,
    pub function: u16,
    pub params: Vec<u16>,
}

impl SubCommand {
    pub fn new(kind: u8, class: u8, function: u16, params: Vec<u16>) -> Self {
        Self {
            index: 0,
            kind,
            class,
            function,
            params,
        }
    }

    /// Encoded size in bytes.
    pub fn wire_len(&self) -> usize {
        SUBCOMMAND_HEADER_SIZE + self.params.len() * 2
    }
}

/// A control frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub sequence: u8,
    pub control: ControlFlags,
    pub channel: u16,
    pub subcommands: Vec<SubCommand>,
}

impl ControlMessage {
    /// Bare acknowledgement of `sequence` on `channel`.
    pub fn ack(sequence: u8, channel: u16) -> Self {
        Self {
            sequence,
            control: ControlFlags::ACK,
            channel,
            subcommands: Vec::new(),
        }
    }

    /// Function code of the first sub-command.
    pub fn function(&self) -> Option<u16> {
        self.subcommands.first().map(|sub| sub.function)
    }

    /// Parameters of the first sub-command.
    pub fn params(&self) -> &[u16] {
        self.subcommands
            .first()
            .map(|sub| sub.params.as_slice())
            .unwrap_or(&[])
    }
}

/// Payload frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub channel: u16,
    pub sequence: u16,
    pub timestamp: u32,
    /// Wire format code of the payload.
    pub format: u8,
    pub flags: u8,
}

/// Encode a control frame.
///
/// Wire format:
/// ```text
/// ┌─────────────┬──────────┬─────────┬──────────┬──────────────────────┐
/// │ Link (14B)  │ Seq (1B) │ Ctl (1B)│ Chan (2B)│ Sub-commands...      │
/// └─────────────┴──────────┴─────────┴──────────┴──────────────────────┘
/// sub-command: len(1) index(1) type(1) class(1) function(2) params(2 each)
/// ```
pub fn encode_control(route: Route, msg: &ControlMessage, dst: &mut BytesMut) -> Result<()> {
    let body: usize = msg.subcommands.iter().map(SubCommand::wire_len).sum();
    let total = LINK_HEADER_SIZE + CONTROL_HEADER_SIZE + body;
    if total > MAX_FRAME_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }
    for sub in &msg.subcommands {
        if sub.params.len() > MAX_PARAMS {
            return Err(FrameError::TooManyParams {
                count: sub.params.len(),
                max: MAX_PARAMS,
            });
        }
    }

    dst.reserve(total);
    put_link(route, ETHERTYPE_CONTROL, dst);
    dst.put_u8(msg.sequence);
    dst.put_u8(msg.control.bits());
    dst.put_u16(msg.channel);
    for (i, sub) in msg.subcommands.iter().enumerate() {
        dst.put_u8(sub.wire_len() as u8);
        dst.put_u8(if sub.index == 0 { i as u8 } else { sub.index });
        dst.put_u8(sub.kind);
        dst.put_u8(sub.class);
        dst.put_u16(sub.function);
        for param in &sub.params {
            dst.put_u16(*param);
        }
    }
    Ok(())
}

/// Decode a control frame.
pub fn decode_control(src: &[u8]) -> Result<ControlMessage> {
    let link = decode_link(src)?;
    if link.ethertype != ETHERTYPE_CONTROL {
        return Err(FrameError::UnknownEthertype(link.ethertype));
    }
    let body = &src[LINK_HEADER_SIZE..];
    if body.len() < CONTROL_HEADER_SIZE {
        return Err(FrameError::Truncated {
            needed: LINK_HEADER_SIZE + CONTROL_HEADER_SIZE,
            got: src.len(),
        });
    }

    let sequence = body[0];
    let control = ControlFlags::from_bits(body[1]);
    let channel = u16::from_be_bytes([body[2], body[3]]);

    let mut subcommands = Vec::new();
    let mut offset = CONTROL_HEADER_SIZE;
    while offset < body.len() {
        let len = body[offset] as usize;
        if len == 0 {
            // Link padding.
            break;
        }
        if len < SUBCOMMAND_HEADER_SIZE {
            return Err(FrameError::InvalidSubCommand {
                offset,
                reason: "length shorter than header",
            });
        }
        if (len - SUBCOMMAND_HEADER_SIZE) % 2 != 0 {
            return Err(FrameError::InvalidSubCommand {
                offset,
                reason: "odd parameter length",
            });
        }
        if offset + len > body.len() {
            return Err(FrameError::InvalidSubCommand {
                offset,
                reason: "length past end of frame",
            });
        }
        let sub = &body[offset..offset + len];
        let params = sub[SUBCOMMAND_HEADER_SIZE..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        subcommands.push(SubCommand {
            index: sub[1],
            kind: sub[2],
            class: sub[3],
            function: u16::from_be_bytes([sub[4], sub[5]]),
            params,
        });
        offset += len;
    }

    Ok(ControlMessage {
        sequence,
        control,
        channel,
        subcommands,
    })
}

/// Encode a payload frame.
pub fn encode_payload(
    route: Route,
    header: &PayloadHeader,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    dst.reserve(LINK_HEADER_SIZE + PAYLOAD_HEADER_SIZE + payload.len());
    put_link(route, ETHERTYPE_PAYLOAD, dst);
    dst.put_u16(header.channel);
    dst.put_u16(header.sequence);
    dst.put_u32(header.timestamp);
    dst.put_u8(header.format);
    dst.put_u8(header.flags);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a payload frame, borrowing the payload bytes.
pub fn decode_payload(src: &[u8]) -> Result<(PayloadHeader, &[u8])> {
    let link = decode_link(src)?;
    if link.ethertype != ETHERTYPE_PAYLOAD {
        return Err(FrameError::UnknownEthertype(link.ethertype));
    }
    let needed = LINK_HEADER_SIZE + PAYLOAD_HEADER_SIZE;
    if src.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            got: src.len(),
        });
    }
    let h = &src[LINK_HEADER_SIZE..needed];
    let header = PayloadHeader {
        channel: u16::from_be_bytes([h[0], h[1]]),
        sequence: u16::from_be_bytes([h[2], h[3]]),
        timestamp: u32::from_be_bytes([h[4], h[5], h[6], h[7]]),
        format: h[8],
        flags: h[9],
    };
    Ok((header, &src[needed..]))
}

/// Decode the link header.
pub fn decode_link(src: &[u8]) -> Result<LinkHeader> {
    if src.len() < LINK_HEADER_SIZE {
        return Err(FrameError::Truncated {
            needed: LINK_HEADER_SIZE,
            got: src.len(),
        });
    }
    let mut dst = [0u8; 6];
    let mut from = [0u8; 6];
    dst.copy_from_slice(&src[0..6]);
    from.copy_from_slice(&src[6..12]);
    Ok(LinkHeader {
        route: Route {
            dst: MacAddr(dst),
            src: MacAddr(from),
        },
        ethertype: u16::from_be_bytes([src[12], src[13]]),
    })
}

/// Classify raw frame bytes and extract the channel they address.
pub fn classify(src: &[u8]) -> Result<(FrameClass, u16)> {
    let link = decode_link(src)?;
    let (class, header) = match link.ethertype {
        ETHERTYPE_CONTROL => (FrameClass::Control, CONTROL_HEADER_SIZE),
        ETHERTYPE_PAYLOAD => (FrameClass::Payload, PAYLOAD_HEADER_SIZE),
        other => return Err(FrameError::UnknownEthertype(other)),
    };
    let needed = LINK_HEADER_SIZE + header;
    if src.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            got: src.len(),
        });
    }
    let at = match class {
        FrameClass::Control => LINK_HEADER_SIZE + 2,
        _ => LINK_HEADER_SIZE,
    };
    Ok((class, u16::from_be_bytes([src[at], src[at + 1]])))
}

fn put_link(route: Route, ethertype: u16, dst: &mut BytesMut) {
    dst.put_slice(&route.dst.0);
    dst.put_slice(&route.src.0);
    dst.put_u16(ethertype);
}
