use crate::frame::Frame;

/// Errors that can occur when building rings or frame buffers.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Ring capacity must be a non-zero power of two.
    #[error("invalid ring capacity {capacity} (must be a non-zero power of two)")]
    InvalidCapacity { capacity: usize },

    /// The frame does not fit in a ring buffer.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Rejected submission. The frame is handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Every slot holds a frame (ring full).
    #[error("ring busy")]
    Busy(Frame),

    /// The same frame is still referenced by an unretrieved slot.
    #[error("frame {} already submitted", .0.id())]
    AlreadySubmitted(Frame),
}

impl SubmitError {
    /// Take back ownership of the rejected frame.
    pub fn into_frame(self) -> Frame {
        match self {
            SubmitError::Busy(frame) | SubmitError::AlreadySubmitted(frame) => frame,
        }
    }

    /// True when the rejection is plain backpressure.
    pub fn is_busy(&self) -> bool {
        matches!(self, SubmitError::Busy(_))
    }
}

pub type Result<T> = std::result::Result<T, RingError>;
