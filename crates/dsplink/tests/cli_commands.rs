#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::{Command, Output};

fn dsplink(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dsplink"))
        .args(args)
        .env_remove("DSPLINK_CONFIG")
        .env_remove("RUST_LOG")
        .output()
        .expect("dsplink should run")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).expect("stdout should be one JSON document")
}

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "dsplink-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

#[test]
fn selftest_passes_against_the_emulator() {
    let output = dsplink(&["selftest", "--format", "json"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = stdout_json(&output);
    assert!(report["schema_id"]
        .as_str()
        .is_some_and(|s| s.ends_with("selftest-report.schema.json")));
    assert_eq!(report["overall"], "pass");
    let names: Vec<&str> = report["checks"]
        .as_array()
        .expect("checks array")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"retransmit"));
    assert!(names.contains(&"fault_recovery"));
}

#[test]
fn ping_reports_round_trips() {
    let output = dsplink(&["ping", "-c", "3", "--format", "json"]);
    assert_eq!(output.status.code(), Some(0));

    let report = stdout_json(&output);
    assert_eq!(report["count"], 3);
    assert_eq!(report["rtt_ms"].as_array().map(Vec::len), Some(3));
}

#[test]
fn ping_against_a_mute_device_times_out() {
    let output = dsplink(&[
        "ping",
        "-c",
        "1",
        "--sim-mute",
        "--command-timeout",
        "20ms",
        "--format",
        "json",
    ]);
    assert_eq!(output.status.code(), Some(124));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ping failed"), "stderr: {stderr}");
}

#[test]
fn ping_survives_dropped_commands() {
    let output = dsplink(&[
        "ping",
        "-c",
        "1",
        "--sim-drop",
        "1",
        "--command-timeout",
        "20ms",
        "--format",
        "json",
    ]);
    assert_eq!(output.status.code(), Some(0));
    let report = stdout_json(&output);
    assert!(report["retransmitted"].as_u64().is_some_and(|n| n >= 1));
}

#[test]
fn transcode_reports_converted_sizes() {
    let output = dsplink(&[
        "transcode",
        "--from",
        "ulaw",
        "--to",
        "g729a",
        "--frames",
        "5",
        "--format",
        "json",
    ]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = stdout_json(&output);
    assert_eq!(report["packets"], 5);
    assert_eq!(report["bytes_in"], 800);
    assert_eq!(report["bytes_out"], 100);
    assert_eq!(report["channel"], "enc0");
}

#[test]
fn transcode_writes_output_file() {
    let dir = unique_temp_dir("transcode");
    let input = dir.join("in.g729");
    let output_path = dir.join("out.ulaw");
    std::fs::write(&input, vec![0u8; 40]).expect("input should be writable");

    let output = dsplink(&[
        "transcode",
        "--from",
        "g729a",
        "--to",
        "ulaw",
        "--input",
        input.to_str().expect("utf-8 path"),
        "--output",
        output_path.to_str().expect("utf-8 path"),
        "--format",
        "json",
    ]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let converted = std::fs::read(&output_path).expect("output should exist");
    assert_eq!(converted.len(), 320);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unsupported_conversion_is_a_usage_error() {
    let output = dsplink(&["transcode", "--from", "ulaw", "--to", "alaw"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn missing_config_file_is_a_usage_error() {
    let output = dsplink(&["ping", "--config", "/nonexistent/dsplink.json"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn stats_lists_opened_channels() {
    let output = dsplink(&["stats", "--pairs", "2", "--open", "1", "--format", "json"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = stdout_json(&output);
    assert!(report["schema_id"]
        .as_str()
        .is_some_and(|s| s.ends_with("device-stats.schema.json")));
    let channels = report["status"]["channels"].as_array().expect("channels array");
    assert_eq!(channels.len(), 4);
    assert_eq!(channels[0]["channel"], "enc0");
    assert_eq!(channels[0]["state"], "busy");
}

#[test]
fn soak_runs_for_a_fixed_duration() {
    let output = dsplink(&[
        "soak",
        "--pairs",
        "2",
        "--duration",
        "200ms",
        "--format",
        "json",
    ]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = stdout_json(&output);
    let channels = report["channels"].as_array().expect("channels array");
    assert_eq!(channels.len(), 2);
    assert!(channels.iter().all(|c| c["read"].as_u64().is_some_and(|n| n > 0)));
}

#[test]
fn envinfo_reports_version_and_formats() {
    let output = dsplink(&["envinfo", "--format", "json"]);
    assert_eq!(output.status.code(), Some(0));

    let report = stdout_json(&output);
    assert_eq!(report["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(report["formats"].as_array().map(Vec::len), Some(5));
}

#[test]
fn version_prints_name() {
    let output = dsplink(&["version"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("dsplink "));
}
