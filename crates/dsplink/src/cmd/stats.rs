use dsplink_device::{CodecFormat, DeviceStatistics, DeviceStatus};
use serde::Serialize;

use crate::cmd::{Bench, StatsArgs};
use crate::exit::{device_error, CliResult, SUCCESS};
use crate::output::{channel_table, new_table, print_json, schema_id, OutputFormat};

#[derive(Debug, Serialize)]
struct StatsOutput {
    schema_id: String,
    statistics: DeviceStatistics,
    status: DeviceStatus,
}

pub fn run(args: StatsArgs, format: OutputFormat) -> CliResult<i32> {
    let bench = Bench::start(&args.device)?;

    let mut handles = Vec::with_capacity(args.open);
    for _ in 0..args.open {
        let handle = bench
            .device
            .open(CodecFormat::Ulaw, CodecFormat::G729a)
            .map_err(|err| device_error("open failed", err))?;
        handles.push(handle);
    }

    let statistics = bench
        .device
        .statistics()
        .map_err(|err| device_error("statistics failed", err))?;
    let output = StatsOutput {
        schema_id: schema_id("device-stats"),
        statistics,
        status: bench.device.status(),
    };

    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(&output),
        OutputFormat::Table | OutputFormat::Pretty => {
            let s = &output.statistics;
            let mut table = new_table(vec!["COUNTER", "VALUE"]);
            table.add_row(vec!["frames received".to_string(), s.frames_received.to_string()]);
            table.add_row(vec!["frames sent".to_string(), s.frames_sent.to_string()]);
            table.add_row(vec!["active channels".to_string(), s.active_channels.to_string()]);
            table.add_row(vec!["load %".to_string(), s.load_percent.to_string()]);
            table.add_row(vec!["alerts".to_string(), s.alerts.to_string()]);
            let e = &output.status.engine;
            table.add_row(vec!["commands completed".to_string(), e.completed.to_string()]);
            table.add_row(vec!["retransmitted".to_string(), e.retransmitted.to_string()]);
            table.add_row(vec!["timed out".to_string(), e.timed_out.to_string()]);
            println!("{table}");
            println!("{}", channel_table(&output.status.channels));
        }
    }

    for handle in handles {
        bench
            .device
            .close(handle)
            .map_err(|err| device_error("close failed", err))?;
    }
    Ok(SUCCESS)
}
