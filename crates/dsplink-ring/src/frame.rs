use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};

use crate::error::{Result, RingError};

/// Largest frame the link carries (Ethernet MTU plus link header and FCS).
pub const MAX_FRAME_SIZE: usize = 1518;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a frame buffer. Clones of a frame share the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    fn next() -> Self {
        Self(NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which ring a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Tx,
    /// Device to host.
    Rx,
}

/// Classification assigned by the transport once the header is inspected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameClass {
    #[default]
    Unclassified,
    Control,
    Payload,
}

/// Small routing tag carried alongside the frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTag {
    pub direction: Direction,
    /// Device channel number, once known.
    pub channel: Option<u16>,
    pub class: FrameClass,
    /// Opaque owner token (the command engine stores its entry token here).
    pub token: Option<u64>,
}

impl FrameTag {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            channel: None,
            class: FrameClass::Unclassified,
            token: None,
        }
    }
}

/// A fixed-maximum-size buffer exchanged with the device.
#[derive(Clone)]
pub struct Frame {
    id: FrameId,
    data: BytesMut,
    tag: FrameTag,
}

impl Frame {
    /// Build an outbound frame from encoded bytes.
    pub fn outbound(data: BytesMut) -> Result<Self> {
        check_size(data.len())?;
        Ok(Self {
            id: FrameId::next(),
            data,
            tag: FrameTag::new(Direction::Tx),
        })
    }

    /// An empty receive buffer with room for one maximum-size frame.
    pub fn empty_rx() -> Self {
        Self {
            id: FrameId::next(),
            data: BytesMut::with_capacity(MAX_FRAME_SIZE),
            tag: FrameTag::new(Direction::Rx),
        }
    }

    /// Replace the contents with `src` (device side of a receive completion).
    pub fn fill(&mut self, src: &[u8]) -> Result<()> {
        check_size(src.len())?;
        self.data.clear();
        self.data.extend_from_slice(src);
        Ok(())
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn tag(&self) -> &FrameTag {
        &self.tag
    }

    pub fn tag_mut(&mut self) -> &mut FrameTag {
        &mut self.tag
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the frame, keeping only its bytes.
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("tag", &self.tag)
            .finish()
    }
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(RingError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}
