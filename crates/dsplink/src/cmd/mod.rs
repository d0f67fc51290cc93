use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use dsplink_device::{CodecFormat, Device, DeviceConfig, Emulator, SimConfig};
use dsplink_ring::RingPair;

use crate::exit::{device_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod envinfo;
pub mod ping;
pub mod selftest;
pub mod soak;
pub mod stats;
pub mod transcode;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Boot an emulated device and run end-to-end checks.
    Selftest(SelftestArgs),
    /// Measure command round trips.
    Ping(PingArgs),
    /// Show firmware counters and host-side channel state.
    Stats(StatsArgs),
    /// Push audio through one channel.
    Transcode(TranscodeArgs),
    /// Drive every channel until interrupted or the duration elapses.
    Soak(SoakArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Print build and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Selftest(args) => selftest::run(args, format),
        Command::Ping(args) => ping::run(args, format),
        Command::Stats(args) => stats::run(args, format),
        Command::Transcode(args) => transcode::run(args, format),
        Command::Soak(args) => soak::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

/// Device setup shared by every command that talks to a device.
#[derive(Args, Debug, Clone, Default)]
pub struct DeviceArgs {
    /// Device configuration file (JSON).
    #[arg(long, value_name = "FILE", env = "DSPLINK_CONFIG")]
    pub config: Option<PathBuf>,
    /// Encoder/decoder pairs, overriding the configuration file.
    #[arg(long, value_name = "N")]
    pub pairs: Option<u16>,
    /// Per-attempt command timeout (e.g. 50ms, 2s).
    #[arg(long, value_name = "DURATION")]
    pub command_timeout: Option<String>,
    /// Emulator: silently drop the next N commands after boot.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub sim_drop: usize,
    /// Emulator: answer every command twice.
    #[arg(long)]
    pub sim_duplicate: bool,
    /// Emulator: stop answering commands after boot.
    #[arg(long)]
    pub sim_mute: bool,
}

#[derive(Args, Debug)]
pub struct SelftestArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Number of pings.
    #[arg(long, short = 'c', default_value_t = 4)]
    pub count: usize,
    /// Pause between pings (e.g. 100ms).
    #[arg(long, default_value = "0ms")]
    pub interval: String,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Open this many ulaw -> g729a channels before reading counters.
    #[arg(long, default_value_t = 0)]
    pub open: usize,
}

#[derive(Args, Debug)]
pub struct TranscodeArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Source format (ulaw, alaw, slin, g729a, g723).
    #[arg(long, default_value = "ulaw")]
    pub from: CodecFormat,
    /// Destination format.
    #[arg(long, default_value = "g729a")]
    pub to: CodecFormat,
    /// Read source audio from a file instead of generating a test pattern.
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,
    /// Write converted audio to a file.
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,
    /// Packets to generate when no input file is given.
    #[arg(long, default_value_t = 50)]
    pub frames: usize,
}

#[derive(Args, Debug)]
pub struct SoakArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Channels to drive. Default: one encoder per pair.
    #[arg(long)]
    pub channels: Option<usize>,
    /// Stop after this long (e.g. 10s). Runs until Ctrl-C when omitted.
    #[arg(long)]
    pub duration: Option<String>,
    #[arg(long, default_value = "ulaw")]
    pub from: CodecFormat,
    #[arg(long, default_value = "g729a")]
    pub to: CodecFormat,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}

/// An emulated board with a booted device attached to it.
pub struct Bench {
    pub device: Device,
    pub sim: Emulator,
}

impl Bench {
    pub fn start(args: &DeviceArgs) -> CliResult<Self> {
        let config = load_config(args)?;
        let rings = RingPair::new(&config.transport.rings)
            .map_err(|err| device_error("ring setup failed", err.into()))?;
        let sim = Emulator::spawn(
            SimConfig {
                link: config.transport.link(),
                ..SimConfig::default()
            },
            rings.clone(),
        )
        .map_err(|err| device_error("emulator start failed", err))?;

        let device = Device::attach("sim0", config, rings, sim.board())
            .map_err(|err| device_error("attach failed", err))?;
        device.start().map_err(|err| device_error("worker start failed", err))?;
        device.boot().map_err(|err| device_error("boot failed", err))?;

        sim.set_drop_commands(args.sim_drop);
        sim.set_duplicate_replies(args.sim_duplicate);
        sim.set_mute(args.sim_mute);
        tracing::debug!(
            drop = args.sim_drop,
            duplicate = args.sim_duplicate,
            mute = args.sim_mute,
            "emulator ready"
        );
        Ok(Self { device, sim })
    }
}

pub fn load_config(args: &DeviceArgs) -> CliResult<DeviceConfig> {
    let mut config = match &args.config {
        Some(path) => DeviceConfig::load(path)
            .map_err(|err| device_error(&format!("failed loading {}", path.display()), err))?,
        None => DeviceConfig::default(),
    };
    if let Some(pairs) = args.pairs {
        config.channels.pairs = pairs;
    }
    if let Some(timeout) = &args.command_timeout {
        config.engine.command_timeout = parse_duration(timeout)?;
    }
    Ok(config)
}

/// Parse `150ms`, `2s` or a bare number of seconds. `0ms` is allowed.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
