use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dsplink_device::{ChannelHandle, Device, DeviceError, ReadMode, WriteOutcome};
use serde::Serialize;

use crate::cmd::selftest::packet_samples;
use crate::cmd::{install_ctrlc_handler, parse_duration, Bench, SoakArgs};
use crate::exit::{device_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{millis, new_table, print_json, schema_id, OutputFormat};

const READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Serialize)]
struct ChannelReport {
    channel: String,
    written: u64,
    read: u64,
    dropped: u64,
    timeouts: u64,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SoakOutput {
    schema_id: String,
    elapsed_ms: f64,
    channels: Vec<ChannelReport>,
    retransmitted: u64,
    timed_out: u64,
}

pub fn run(args: SoakArgs, format: OutputFormat) -> CliResult<i32> {
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;
    let bench = Bench::start(&args.device)?;
    let count = args
        .channels
        .unwrap_or(usize::from(bench.device.config().channels.pairs));
    if count == 0 {
        return Err(CliError::new(USAGE, "--channels must be at least 1"));
    }

    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let handle = bench
            .device
            .open(args.from, args.to)
            .map_err(|err| device_error("open failed", err))?;
        handles.push(handle);
    }

    let running = Arc::new(AtomicBool::new(true));
    if duration.is_none() {
        install_ctrlc_handler(Arc::clone(&running))?;
    }
    let deadline = duration.map(|d| Instant::now() + d);
    let packet = vec![0x55; args.from.bytes_for(packet_samples(args.from, args.to))];
    tracing::info!(channels = count, from = %args.from, to = %args.to, "soak started");

    let started = Instant::now();
    let reports: Vec<ChannelReport> = std::thread::scope(|scope| {
        let workers: Vec<_> = handles
            .iter()
            .map(|handle| {
                let device = &bench.device;
                let running = &running;
                let packet = &packet;
                scope.spawn(move || drive(device, handle, packet, running, deadline))
            })
            .collect();
        workers
            .into_iter()
            .zip(&handles)
            .map(|(worker, handle)| {
                worker.join().unwrap_or_else(|_| ChannelReport {
                    channel: handle.channel.to_string(),
                    error: Some("worker panicked".to_string()),
                    ..ChannelReport::default()
                })
            })
            .collect()
    });
    let elapsed = started.elapsed();

    for handle in handles {
        if let Err(err) = bench.device.close(handle) {
            tracing::warn!(error = %err, "close failed");
        }
    }

    let engine = bench.device.engine().stats();
    let output = SoakOutput {
        schema_id: schema_id("soak-report"),
        elapsed_ms: millis(elapsed),
        channels: reports,
        retransmitted: engine.retransmitted,
        timed_out: engine.timed_out,
    };
    let failed = output.channels.iter().any(|c| c.error.is_some());

    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(&output),
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut table =
                new_table(vec!["CHANNEL", "WRITTEN", "READ", "DROPPED", "TIMEOUTS", "ERROR"]);
            for c in &output.channels {
                table.add_row(vec![
                    c.channel.clone(),
                    c.written.to_string(),
                    c.read.to_string(),
                    c.dropped.to_string(),
                    c.timeouts.to_string(),
                    c.error.clone().unwrap_or_default(),
                ]);
            }
            println!("{table}");
            println!(
                "{:.0} ms, {} retransmitted, {} timed out",
                output.elapsed_ms, output.retransmitted, output.timed_out
            );
        }
    }

    Ok(if failed { FAILURE } else { SUCCESS })
}

/// Write one packet and wait for its conversion until stopped.
fn drive(
    device: &Device,
    handle: &ChannelHandle,
    packet: &[u8],
    running: &AtomicBool,
    deadline: Option<Instant>,
) -> ChannelReport {
    let mut report = ChannelReport {
        channel: handle.channel.to_string(),
        ..ChannelReport::default()
    };
    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        match device.write(handle, packet) {
            Ok(WriteOutcome::Queued) => report.written += 1,
            Ok(WriteOutcome::Dropped) => {
                report.dropped += 1;
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(err) => {
                report.error = Some(err.to_string());
                break;
            }
        }
        match device.read(handle, ReadMode::Timeout(READ_TIMEOUT)) {
            Ok(_) => report.read += 1,
            Err(DeviceError::ReadTimeout(_)) => report.timeouts += 1,
            Err(err) => {
                report.error = Some(err.to_string());
                break;
            }
        }
    }
    tracing::debug!(
        channel = %handle.channel,
        written = report.written,
        read = report.read,
        "soak worker done"
    );
    report
}
