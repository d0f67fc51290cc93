//! Device configuration.
//!
//! Every struct is `Default` and deserializes from JSON with missing fields
//! falling back to the defaults. Durations are written in milliseconds.

use std::path::Path;
use std::time::Duration;

use dsplink_frame::{LinkAddrs, MacAddr};
use dsplink_ring::RingConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default wait for an ack or response before retransmitting.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Default interval between watchdog sweeps when the link is idle.
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_millis(500);

/// Default retransmissions before a command times out.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default cap on samples written but not yet returned, per channel.
pub const DEFAULT_MAX_SAMPLES_IN_FLIGHT: u32 = 1600;

/// Default receive queue depth per channel.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 64;

/// Default number of encoder/decoder pairs.
pub const DEFAULT_CHANNEL_PAIRS: u16 = 16;

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Rings and link addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub rings: RingConfig,
    pub host_addr: [u8; 6],
    pub device_addr: [u8; 6],
}

impl TransportConfig {
    pub fn link(&self) -> LinkAddrs {
        LinkAddrs {
            host: MacAddr(self.host_addr),
            device: MacAddr(self.device_addr),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let link = LinkAddrs::default();
        Self {
            rings: RingConfig::default(),
            host_addr: link.host.0,
            device_addr: link.device.0,
        }
    }
}

/// Command retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(with = "millis", rename = "command_timeout_ms")]
    pub command_timeout: Duration,
    #[serde(with = "millis", rename = "watchdog_period_ms")]
    pub watchdog_period: Duration,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            watchdog_period: DEFAULT_WATCHDOG_PERIOD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Payload flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub max_samples_in_flight: u32,
    pub max_queued_frames: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_samples_in_flight: DEFAULT_MAX_SAMPLES_IN_FLIGHT,
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
        }
    }
}

/// Channel layout and per-channel voice options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Encoder/decoder pairs. Pair `i` uses timeslots `2i` and `2i + 1`.
    pub pairs: u16,
    /// Reset a faulted device on the next allocation instead of failing.
    pub auto_reset: bool,
    /// Packetization interval passed to VOICE_OPTIONS.
    pub packet_ms: u16,
    /// Base UDP port for SET_IP_HEADER; the timeslot is added.
    pub base_port: u16,
    pub tone_detection: bool,
    pub echo_cancel: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pairs: DEFAULT_CHANNEL_PAIRS,
            auto_reset: true,
            packet_ms: 20,
            base_port: 0x5000,
            tone_detection: false,
            echo_cancel: false,
        }
    }
}

/// Device clock setup sent by SET_CLOCK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub core_mhz: u16,
    pub bus_mhz: u16,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            core_mhz: 250,
            bus_mhz: 125,
        }
    }
}

/// Device-wide setup performed by boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub clock: ClockConfig,
    pub tdm_bus_mode: u16,
    pub alert_mode: u16,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            tdm_bus_mode: 0x0004,
            alert_mode: 0x0001,
        }
    }
}

/// Everything a [`Device`](crate::Device) needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub transport: TransportConfig,
    pub engine: EngineConfig,
    pub router: RouterConfig,
    pub channels: ChannelConfig,
    pub boot: BootConfig,
}

impl DeviceConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
