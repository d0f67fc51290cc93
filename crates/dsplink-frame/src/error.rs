/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer ends before the structure it should contain.
    #[error("truncated frame ({got} bytes, need {needed})")]
    Truncated { needed: usize, got: usize },

    /// The link header carries an ethertype this link does not speak.
    #[error("unknown ethertype 0x{0:04x}")]
    UnknownEthertype(u16),

    /// A sub-command header is inconsistent with the frame.
    #[error("invalid sub-command at offset {offset}: {reason}")]
    InvalidSubCommand { offset: usize, reason: &'static str },

    /// More parameters than a one-byte sub-command length can describe.
    #[error("too many parameters ({count}, max {max})")]
    TooManyParams { count: usize, max: usize },

    /// The payload exceeds what fits in one frame.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Ring-level error (frame buffer construction).
    #[error("ring error: {0}")]
    Ring(#[from] dsplink_ring::RingError),
}

pub type Result<T> = std::result::Result<T, FrameError>;
