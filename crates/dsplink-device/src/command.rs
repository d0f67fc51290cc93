//! Commands understood by the transcoder firmware.
//!
//! A [`Command`] is one sub-command addressed to a device channel, plus the
//! delivery guarantees the caller wants. The engine turns it into a control
//! frame with a sequence number.

use dsplink_frame::{class, function, kind, ControlFlags, ControlMessage, LinkAddrs, SubCommand, SUPERVISOR};

use crate::config::{BootConfig, ChannelConfig, ClockConfig};
use crate::error::{DeviceError, Result};
use crate::format::CodecFormat;

/// Delivery guarantees for a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Wait for the device to acknowledge the frame.
    pub needs_ack: bool,
    /// Wait for a response carrying a status and results.
    pub needs_response: bool,
    /// Ask the device not to acknowledge. Implied by `needs_response`.
    pub suppress_ack: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    channel: u16,
    sub: SubCommand,
    flags: CommandFlags,
}

impl Command {
    /// Configuration change on `channel` that the device acknowledges.
    pub fn new(channel: u16, class: u8, function: u16, params: Vec<u16>) -> Self {
        Self {
            channel,
            sub: SubCommand::new(kind::CONFIG_CHANGE, class, function, params),
            flags: CommandFlags {
                needs_ack: true,
                ..CommandFlags::default()
            },
        }
    }

    /// Query on `channel`; always answered with a response.
    pub fn query(channel: u16, class: u8, function: u16, params: Vec<u16>) -> Self {
        Self {
            channel,
            sub: SubCommand::new(kind::QUERY, class, function, params),
            flags: CommandFlags::default(),
        }
        .expect_response()
    }

    /// Wait for a response instead of an ack.
    #[must_use]
    pub fn expect_response(mut self) -> Self {
        self.flags.needs_ack = false;
        self.flags.needs_response = true;
        self.flags.suppress_ack = true;
        self
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn function(&self) -> u16 {
        self.sub.function
    }

    pub fn params(&self) -> &[u16] {
        &self.sub.params
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    /// Build the control message for this command.
    pub(crate) fn to_message(&self, sequence: u8) -> ControlMessage {
        let control = if self.flags.suppress_ack || self.flags.needs_response {
            ControlFlags::SUPPRESS_ACK
        } else {
            ControlFlags::empty()
        };
        ControlMessage {
            sequence,
            control,
            channel: self.channel,
            subcommands: vec![self.sub.clone()],
        }
    }

    // Channel lifecycle

    /// Response: `[status, channel]`.
    pub fn create_channel(timeslot: u16) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::CREATE_CHANNEL, vec![timeslot]).expect_response()
    }

    pub fn destroy_channel(number: u16) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::DESTROY_CHANNEL, vec![number]).expect_response()
    }

    pub fn set_ip_header(number: u16, port: u16) -> Self {
        Self::new(number, class::CHANNEL, function::SET_IP_HEADER, vec![port, port])
    }

    pub fn voice_options(number: u16, format: CodecFormat, options: &ChannelConfig) -> Self {
        Self::new(
            number,
            class::CHANNEL,
            function::VOICE_OPTIONS,
            vec![
                u16::from(format.wire_code()),
                options.packet_ms,
                u16::from(options.echo_cancel),
            ],
        )
    }

    pub fn tone_control(number: u16, enabled: bool) -> Self {
        Self::new(number, class::CHANNEL, function::TONE_CONTROL, vec![u16::from(enabled)])
    }

    pub fn voice_enable(number: u16, enabled: bool) -> Self {
        Self::new(number, class::CHANNEL, function::VOICE_ENABLE, vec![u16::from(enabled)])
    }

    /// Full configuration of one device channel, in the order the firmware expects.
    pub fn configure_channel(number: u16, port: u16, format: CodecFormat, options: &ChannelConfig) -> Vec<Self> {
        vec![
            Self::set_ip_header(number, port),
            Self::voice_options(number, format, options),
            Self::tone_control(number, options.tone_detection),
            Self::voice_enable(number, true),
        ]
    }

    pub fn connect(encoder: u16, decoder: u16, src: CodecFormat, dst: CodecFormat) -> Self {
        Self::new(
            SUPERVISOR,
            class::DEVICE,
            function::CONNECT,
            vec![encoder, decoder, u16::from(src.wire_code()), u16::from(dst.wire_code())],
        )
        .expect_response()
    }

    pub fn disconnect(encoder: u16, decoder: u16) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::DISCONNECT, vec![encoder, decoder]).expect_response()
    }

    // Device-wide

    pub fn ping() -> Self {
        Self::query(SUPERVISOR, class::DEVICE, function::PING, Vec::new())
    }

    pub fn get_statistics() -> Self {
        Self::query(SUPERVISOR, class::DEVICE, function::GET_STATISTICS, Vec::new())
    }

    pub fn set_clock(clock: ClockConfig) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::SET_CLOCK, vec![clock.core_mhz, clock.bus_mhz])
    }

    pub fn tdm_select_bus_mode(mode: u16) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::TDM_SELECT_BUS_MODE, vec![mode])
    }

    pub fn set_eth_header(link: &LinkAddrs) -> Self {
        let mut params = Vec::with_capacity(6);
        for mac in [link.host.0, link.device.0] {
            params.extend(mac.chunks(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])));
        }
        Self::new(SUPERVISOR, class::DEVICE, function::SET_ETH_HEADER, params)
    }

    pub fn ip_service_config(enabled: bool) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::IP_SERVICE_CONFIG, vec![u16::from(enabled)])
    }

    pub fn arp_service_config(enabled: bool) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::ARP_SERVICE_CONFIG, vec![u16::from(enabled)])
    }

    pub fn icmp_service_config(enabled: bool) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::ICMP_SERVICE_CONFIG, vec![u16::from(enabled)])
    }

    pub fn set_alert_mode(mode: u16) -> Self {
        Self::new(SUPERVISOR, class::DEVICE, function::SET_ALERT_MODE, vec![mode])
    }

    /// Device-wide setup run after every board reset.
    pub fn boot_sequence(boot: &BootConfig, link: &LinkAddrs) -> Vec<Self> {
        vec![
            Self::set_clock(boot.clock),
            Self::tdm_select_bus_mode(boot.tdm_bus_mode),
            Self::set_eth_header(link),
            Self::ip_service_config(true),
            Self::arp_service_config(true),
            Self::icmp_service_config(true),
            Self::set_alert_mode(boot.alert_mode),
        ]
    }
}

/// How the device answered a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack { sequence: u8 },
    Response(ControlMessage),
}

impl Reply {
    /// Response status; acks count as success.
    pub fn status(&self) -> u16 {
        match self {
            Self::Ack { .. } => 0,
            Self::Response(msg) => msg.params().first().copied().unwrap_or(0),
        }
    }

    /// Result words after the status.
    pub fn results(&self) -> &[u16] {
        match self {
            Self::Ack { .. } => &[],
            Self::Response(msg) => msg.params().get(1..).unwrap_or(&[]),
        }
    }

    /// Fail with [`DeviceError::Rejected`] on a non-zero status.
    pub fn check(self, function: u16) -> Result<Self> {
        match self.status() {
            0 => Ok(self),
            status => Err(DeviceError::Rejected { function, status }),
        }
    }
}
