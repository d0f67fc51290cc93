use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use dsplink_device::ChannelInfo;
use serde::Serialize;

const SCHEMA_BASE: &str = "https://schemas.3leaps.dev/dsplink/cli/v1";

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Schema URL for a report kind, e.g. `schema_id("ping-report")`.
pub fn schema_id(kind: &str) -> String {
    format!("{SCHEMA_BASE}/{kind}.schema.json")
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn channel_table(channels: &[ChannelInfo]) -> Table {
    let mut table = new_table(vec!["CHANNEL", "STATE", "DEVICE CH", "SRC", "DST"]);
    for info in channels {
        table.add_row(vec![
            info.channel.to_string(),
            format!("{:?}", info.state).to_lowercase(),
            info.device_channel
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            info.src.map_or_else(|| "-".to_string(), |f| f.to_string()),
            info.dst.map_or_else(|| "-".to_string(), |f| f.to_string()),
        ]);
    }
    table
}

/// Milliseconds rounded to two decimals.
pub fn millis(duration: std::time::Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}
