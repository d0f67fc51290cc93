//! Codec formats the transcoder understands.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// Samples per second for every supported format.
pub const SAMPLE_RATE: u32 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFormat {
    /// G.711 mu-law, one byte per sample.
    Ulaw,
    /// G.711 A-law, one byte per sample.
    Alaw,
    /// Signed 16-bit linear, two bytes per sample.
    Slin,
    /// G.729A, 10 bytes per 10 ms.
    G729a,
    /// G.723.1 (6.3 kbit/s), 24 bytes per 30 ms.
    G723,
}

impl CodecFormat {
    pub const ALL: [Self; 5] = [Self::Ulaw, Self::Alaw, Self::Slin, Self::G729a, Self::G723];

    /// Format code carried in payload headers and VOICE_OPTIONS.
    pub const fn wire_code(self) -> u8 {
        match self {
            Self::Ulaw => 0,
            Self::G723 => 4,
            Self::Alaw => 8,
            Self::Slin => 11,
            Self::G729a => 18,
        }
    }

    pub fn from_wire(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.wire_code() == code)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Ulaw => "ulaw",
            Self::Alaw => "alaw",
            Self::Slin => "slin",
            Self::G729a => "g729a",
            Self::G723 => "g723",
        }
    }

    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::G729a | Self::G723)
    }

    /// Samples represented by `bytes` of this format.
    pub const fn samples(self, bytes: usize) -> u32 {
        let samples = match self {
            Self::Ulaw | Self::Alaw => bytes,
            Self::Slin => bytes / 2,
            Self::G729a => bytes * 8,
            Self::G723 => bytes * 10,
        };
        samples as u32
    }

    /// Bytes needed to carry `samples` in this format, rounded down to whole
    /// codec frames.
    pub const fn bytes_for(self, samples: u32) -> usize {
        let samples = samples as usize;
        match self {
            Self::Ulaw | Self::Alaw => samples,
            Self::Slin => samples * 2,
            Self::G729a => samples / 80 * 10,
            Self::G723 => samples / 240 * 24,
        }
    }

    /// Check that the device can convert `src` into `dst`.
    pub fn check_conversion(src: Self, dst: Self) -> Result<()> {
        if src.is_compressed() == dst.is_compressed() {
            return Err(DeviceError::UnsupportedConversion { src, dst });
        }
        Ok(())
    }
}

impl fmt::Display for CodecFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecFormat {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ulaw" | "mulaw" | "pcmu" => Ok(Self::Ulaw),
            "alaw" | "pcma" => Ok(Self::Alaw),
            "slin" | "linear" => Ok(Self::Slin),
            "g729" | "g729a" => Ok(Self::G729a),
            "g723" | "g723.1" => Ok(Self::G723),
            _ => Err(DeviceError::UnknownFormat(s.to_string())),
        }
    }
}
