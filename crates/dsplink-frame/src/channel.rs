//! Channel identifiers, control bits and device function codes.
//!
//! Device channel numbers are assigned by the firmware on channel creation.
//! The value `0xFFFF` is reserved for the supervisor (device-wide) stream.

/// Device-wide control stream.
pub const SUPERVISOR: u16 = 0xFFFF;

/// Link ethertype for control traffic.
pub const ETHERTYPE_CONTROL: u16 = 0x889B;

/// Link ethertype for payload traffic.
pub const ETHERTYPE_PAYLOAD: u16 = 0x0800;

/// Returns a human-readable name for a channel id.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        SUPERVISOR => "SUPERVISOR",
        _ => "CHANNEL",
    }
}

/// Returns true for the reserved supervisor stream.
pub fn is_supervisor(id: u16) -> bool {
    id == SUPERVISOR
}

/// Sub-command `type` field values.
pub mod kind {
    /// Changes configuration; answered with an ack or a response.
    pub const CONFIG_CHANGE: u8 = 0x00;
    /// Reads state; always answered with a response.
    pub const QUERY: u8 = 0x01;
    /// Unsolicited device message.
    pub const INDICATION: u8 = 0x02;
}

/// Sub-command `class` field values.
pub mod class {
    pub const DEVICE: u8 = 0x06;
    pub const CHANNEL: u8 = 0x07;
}

/// Firmware function codes.
pub mod function {
    /// Device → host alert. Params: `[code, severity]`.
    pub const ALERT_INDICATION: u16 = 0x0000;
    pub const PING: u16 = 0x0001;
    /// Params: `[timeslot]`. Response: `[status, channel]`.
    pub const CREATE_CHANNEL: u16 = 0x0010;
    /// Params: `[channel]`.
    pub const DESTROY_CHANNEL: u16 = 0x0011;
    /// Response: `[status, counters...]`.
    pub const GET_STATISTICS: u16 = 0x0013;
    pub const SET_ETH_HEADER: u16 = 0x0100;
    pub const ARP_SERVICE_CONFIG: u16 = 0x0105;
    pub const IP_SERVICE_CONFIG: u16 = 0x0302;
    pub const ICMP_SERVICE_CONFIG: u16 = 0x0304;
    pub const SET_CLOCK: u16 = 0x0411;
    pub const TDM_SELECT_BUS_MODE: u16 = 0x0417;
    pub const SET_ALERT_MODE: u16 = 0x0420;
    pub const VOICE_ENABLE: u16 = 0x8000;
    pub const VOICE_OPTIONS: u16 = 0x8001;
    pub const TONE_CONTROL: u16 = 0x805B;
    pub const SET_IP_HEADER: u16 = 0x9000;
    /// Params: `[encoder, decoder, src_format, dst_format]`.
    pub const CONNECT: u16 = 0x9322;
    pub const DISCONNECT: u16 = 0x9323;

    /// Returns a human-readable name for a function code.
    pub fn name(code: u16) -> &'static str {
        match code {
            ALERT_INDICATION => "ALERT_INDICATION",
            PING => "PING",
            CREATE_CHANNEL => "CREATE_CHANNEL",
            DESTROY_CHANNEL => "DESTROY_CHANNEL",
            GET_STATISTICS => "GET_STATISTICS",
            SET_ETH_HEADER => "SET_ETH_HEADER",
            ARP_SERVICE_CONFIG => "ARP_SERVICE_CONFIG",
            IP_SERVICE_CONFIG => "IP_SERVICE_CONFIG",
            ICMP_SERVICE_CONFIG => "ICMP_SERVICE_CONFIG",
            SET_CLOCK => "SET_CLOCK",
            TDM_SELECT_BUS_MODE => "TDM_SELECT_BUS_MODE",
            SET_ALERT_MODE => "SET_ALERT_MODE",
            VOICE_ENABLE => "VOICE_ENABLE",
            VOICE_OPTIONS => "VOICE_OPTIONS",
            TONE_CONTROL => "TONE_CONTROL",
            SET_IP_HEADER => "SET_IP_HEADER",
            CONNECT => "CONNECT",
            DISCONNECT => "DISCONNECT",
            _ => "UNKNOWN",
        }
    }
}

/// Bits of the control byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ControlFlags(u8);

impl ControlFlags {
    /// The frame acknowledges delivery of `sequence`.
    pub const ACK: Self = Self(0x01);
    /// The frame carries a command's result.
    pub const RESPONSE: Self = Self(0x02);
    /// The sender does not want this frame acknowledged.
    pub const SUPPRESS_ACK: Self = Self(0x04);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_ack(self) -> bool {
        self.contains(Self::ACK)
    }

    pub const fn is_response(self) -> bool {
        self.contains(Self::RESPONSE)
    }

    /// Neither an ack nor a response.
    pub const fn is_new_message(self) -> bool {
        self.0 & (Self::ACK.0 | Self::RESPONSE.0) == 0
    }

    pub const fn suppresses_ack(self) -> bool {
        self.contains(Self::SUPPRESS_ACK)
    }
}
