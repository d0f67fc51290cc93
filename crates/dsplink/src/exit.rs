use std::fmt;
use std::io;

use dsplink_device::DeviceError;
use dsplink_frame::FrameError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Ring(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn device_error(context: &str, err: DeviceError) -> CliError {
    match err {
        DeviceError::Io(source) => io_error(context, source),
        DeviceError::Frame(err) => frame_error(context, err),
        DeviceError::Allocation { source, .. } if matches!(*source, DeviceError::CommandTimeout { .. }) => {
            CliError::new(TIMEOUT, format!("{context}: {source}"))
        }
        DeviceError::CommandTimeout { .. }
        | DeviceError::ReadTimeout(_)
        | DeviceError::WouldBlock => CliError::new(TIMEOUT, format!("{context}: {err}")),
        DeviceError::Ring(_)
        | DeviceError::DeviceFault(_)
        | DeviceError::Reset
        | DeviceError::Shutdown => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        DeviceError::UnsupportedConversion { .. }
        | DeviceError::UnknownFormat(_)
        | DeviceError::InvalidConfig(_)
        | DeviceError::UnknownDevice(_)
        | DeviceError::DuplicateDevice(_) => CliError::new(USAGE, format!("{context}: {err}")),
        DeviceError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        DeviceError::BufferTooSmall { .. } => CliError::new(INTERNAL, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}
