use std::time::{Duration, Instant};

use dsplink_device::{CodecFormat, ReadMode, WriteOutcome};
use serde::Serialize;

use crate::cmd::selftest::packet_samples;
use crate::cmd::{Bench, TranscodeArgs};
use crate::exit::{device_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{millis, print_json, print_raw, schema_id, OutputFormat};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct TranscodeOutput {
    schema_id: String,
    from: CodecFormat,
    to: CodecFormat,
    channel: String,
    packets: usize,
    dropped: usize,
    bytes_in: usize,
    bytes_out: usize,
    elapsed_ms: f64,
}

pub fn run(args: TranscodeArgs, format: OutputFormat) -> CliResult<i32> {
    CodecFormat::check_conversion(args.from, args.to)
        .map_err(|err| device_error("transcode", err))?;

    let samples = packet_samples(args.from, args.to);
    let packet_len = args.from.bytes_for(samples);
    let input = match &args.input {
        Some(path) => std::fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?,
        None => test_pattern(packet_len * args.frames),
    };
    if input.len() < packet_len {
        return Err(CliError::new(
            USAGE,
            format!("input shorter than one {packet_len}-byte {} packet", args.from),
        ));
    }

    let bench = Bench::start(&args.device)?;
    let handle = bench
        .device
        .open(args.from, args.to)
        .map_err(|err| device_error("open failed", err))?;

    let started = Instant::now();
    let mut converted = Vec::new();
    let mut packets = 0;
    let mut dropped = 0;
    for chunk in input.chunks_exact(packet_len) {
        match bench
            .device
            .write(&handle, chunk)
            .map_err(|err| device_error("write failed", err))?
        {
            WriteOutcome::Queued => {}
            WriteOutcome::Dropped => {
                dropped += 1;
                continue;
            }
        }
        let payload = bench
            .device
            .read(&handle, ReadMode::Timeout(READ_TIMEOUT))
            .map_err(|err| device_error("read failed", err))?;
        converted.extend_from_slice(&payload.data);
        packets += 1;
    }
    let elapsed = started.elapsed();
    let channel = handle.channel.to_string();
    bench
        .device
        .close(handle)
        .map_err(|err| device_error("close failed", err))?;

    if let Some(path) = &args.output {
        std::fs::write(path, &converted)
            .map_err(|err| io_error(&format!("failed writing {}", path.display()), err))?;
    } else if matches!(format, OutputFormat::Raw) {
        print_raw(&converted);
        return Ok(SUCCESS);
    }

    let output = TranscodeOutput {
        schema_id: schema_id("transcode-report"),
        from: args.from,
        to: args.to,
        channel,
        packets,
        dropped,
        bytes_in: packets * packet_len,
        bytes_out: converted.len(),
        elapsed_ms: millis(elapsed),
    };
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(&output),
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "{} -> {} on {}: {} packets, {} bytes in, {} bytes out, {} dropped ({:.2} ms)",
            output.from,
            output.to,
            output.channel,
            output.packets,
            output.bytes_in,
            output.bytes_out,
            output.dropped,
            output.elapsed_ms
        ),
    }
    Ok(SUCCESS)
}

/// Deterministic filler audio.
fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
