use std::time::Duration;

use serde::Serialize;

use crate::cmd::{parse_duration, Bench, PingArgs};
use crate::exit::{device_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{millis, new_table, print_json, schema_id, OutputFormat};

#[derive(Debug, Serialize)]
struct PingOutput {
    schema_id: String,
    device: String,
    count: usize,
    rtt_ms: Vec<f64>,
    min_ms: f64,
    avg_ms: f64,
    max_ms: f64,
    retransmitted: u64,
}

pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    if args.count == 0 {
        return Err(CliError::new(USAGE, "--count must be at least 1"));
    }
    let interval = parse_duration(&args.interval)?;
    let bench = Bench::start(&args.device)?;

    let mut rtts = Vec::with_capacity(args.count);
    for i in 0..args.count {
        if i > 0 && !interval.is_zero() {
            std::thread::sleep(interval);
        }
        let rtt = bench
            .device
            .ping()
            .map_err(|err| device_error("ping failed", err))?;
        tracing::debug!(seq = i, rtt_us = rtt.as_micros() as u64, "pong");
        rtts.push(rtt);
    }

    let output = summarize(bench.device.name(), &rtts, bench.device.engine().stats().retransmitted);
    match format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut table = new_table(vec!["SEQ", "RTT (ms)"]);
            for (i, rtt) in output.rtt_ms.iter().enumerate() {
                table.add_row(vec![i.to_string(), format!("{rtt:.2}")]);
            }
            println!("{table}");
            println!(
                "{} pings: min {:.2} ms, avg {:.2} ms, max {:.2} ms",
                output.count, output.min_ms, output.avg_ms, output.max_ms
            );
        }
        OutputFormat::Raw => {
            for rtt in &output.rtt_ms {
                println!("{rtt}");
            }
        }
    }
    Ok(SUCCESS)
}

fn summarize(device: &str, rtts: &[Duration], retransmitted: u64) -> PingOutput {
    let rtt_ms: Vec<f64> = rtts.iter().copied().map(millis).collect();
    let min = rtts.iter().min().copied().unwrap_or_default();
    let max = rtts.iter().max().copied().unwrap_or_default();
    let total: Duration = rtts.iter().sum();
    let avg = if rtts.is_empty() {
        Duration::ZERO
    } else {
        total / rtts.len() as u32
    };
    PingOutput {
        schema_id: schema_id("ping-report"),
        device: device.to_string(),
        count: rtts.len(),
        rtt_ms,
        min_ms: millis(min),
        avg_ms: millis(avg),
        max_ms: millis(max),
        retransmitted,
    }
}
