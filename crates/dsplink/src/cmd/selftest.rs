use std::time::{Duration, Instant};

use dsplink_device::fault::ALERT_SEVERITY_FATAL;
use dsplink_device::{CodecFormat, Device, DeviceError, FaultSeverity, ReadMode};
use serde::Serialize;

use crate::cmd::{Bench, SelftestArgs};
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, schema_id, OutputFormat};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

const CONVERSIONS: [(CodecFormat, CodecFormat); 4] = [
    (CodecFormat::Ulaw, CodecFormat::G729a),
    (CodecFormat::G729a, CodecFormat::Ulaw),
    (CodecFormat::Slin, CodecFormat::G723),
    (CodecFormat::G723, CodecFormat::Alaw),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn from_result(name: impl Into<String>, result: Result<String, String>) -> Self {
        let (status, detail) = match result {
            Ok(detail) => (CheckStatus::Pass, detail),
            Err(detail) => (CheckStatus::Fail, detail),
        };
        Self {
            name: name.into(),
            status,
            detail,
        }
    }
}

#[derive(Debug, Serialize)]
struct SelftestOutput {
    schema_id: String,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: SelftestArgs, format: OutputFormat) -> CliResult<i32> {
    let mut checks = Vec::new();
    match Bench::start(&args.device) {
        Ok(bench) => {
            checks.push(CheckResult {
                name: "boot".to_string(),
                status: CheckStatus::Pass,
                detail: format!("{} channel pairs", bench.device.config().channels.pairs),
            });
            run_checks(&bench, &mut checks);
        }
        Err(err) => {
            checks.push(CheckResult {
                name: "boot".to_string(),
                status: CheckStatus::Fail,
                detail: err.message,
            });
            checks.push(CheckResult {
                name: "device_checks".to_string(),
                status: CheckStatus::Skip,
                detail: "device did not boot".to_string(),
            });
        }
    }

    let has_fail = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let output = SelftestOutput {
        schema_id: schema_id("selftest-report"),
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };
    print_selftest(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn run_checks(bench: &Bench, checks: &mut Vec<CheckResult>) {
    let device = &bench.device;

    checks.push(CheckResult::from_result(
        "ping",
        device
            .ping()
            .map(|rtt| format!("{rtt:?}"))
            .map_err(|err| err.to_string()),
    ));

    checks.push(CheckResult::from_result(
        "statistics",
        device
            .statistics()
            .map(|s| format!("{} frames received, {} sent", s.frames_received, s.frames_sent))
            .map_err(|err| err.to_string()),
    ));

    for (src, dst) in CONVERSIONS {
        checks.push(CheckResult::from_result(
            format!("transcode_{src}_{dst}"),
            transcode_once(device, src, dst),
        ));
    }

    checks.push(CheckResult::from_result("retransmit", retransmit(bench)));
    checks.push(CheckResult::from_result("fault_recovery", fault_recovery(bench)));
}

/// One packet through a fresh channel; checks the output size.
fn transcode_once(device: &Device, src: CodecFormat, dst: CodecFormat) -> Result<String, String> {
    let samples = packet_samples(src, dst);
    let input = vec![0x55; src.bytes_for(samples)];
    let expected = dst.bytes_for(samples);

    let handle = device.open(src, dst).map_err(|err| err.to_string())?;
    let result = device
        .write(&handle, &input)
        .and_then(|_| device.read(&handle, ReadMode::Timeout(READ_TIMEOUT)));
    let closed = device.close(handle);

    let payload = result.map_err(|err| err.to_string())?;
    closed.map_err(|err| err.to_string())?;
    if payload.data.len() != expected {
        return Err(format!(
            "expected {expected} bytes, got {}",
            payload.data.len()
        ));
    }
    Ok(format!("{} -> {} bytes", input.len(), payload.data.len()))
}

fn retransmit(bench: &Bench) -> Result<String, String> {
    let before = bench.device.engine().stats().retransmitted;
    bench.sim.set_drop_commands(1);
    bench.device.ping().map_err(|err| err.to_string())?;
    let retransmitted = bench.device.engine().stats().retransmitted - before;
    if retransmitted == 0 {
        return Err("dropped command was not retransmitted".to_string());
    }
    Ok(format!("{retransmitted} retransmission(s)"))
}

fn fault_recovery(bench: &Bench) -> Result<String, String> {
    bench.sim.inject_alert(0x0E01, ALERT_SEVERITY_FATAL);
    let deadline = Instant::now() + READ_TIMEOUT;
    while bench.device.status().fault != Some(FaultSeverity::Fatal) {
        if Instant::now() >= deadline {
            return Err("fatal alert not observed".to_string());
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    match bench.device.ping() {
        Err(DeviceError::DeviceFault(_)) => {}
        Ok(_) => return Err("faulted device accepted a command".to_string()),
        Err(err) => return Err(err.to_string()),
    }
    bench.device.reset().map_err(|err| err.to_string())?;
    bench.device.ping().map_err(|err| err.to_string())?;
    Ok("reset after fatal alert".to_string())
}

/// Samples per packet: 20 ms, widened to whole frames of the compressed side.
pub(crate) fn packet_samples(src: CodecFormat, dst: CodecFormat) -> u32 {
    let frame = match (src, dst) {
        (CodecFormat::G723, _) | (_, CodecFormat::G723) => 240,
        _ => 80,
    };
    160_u32.div_ceil(frame) * frame
}

fn print_selftest(output: &SelftestOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("dsplink selftest\n");
            for c in &output.checks {
                println!("  [{:>4}] {:<26} {}", status_text(c.status), c.name, c.detail);
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => println!("{}", output.overall),
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Skip => "SKIP",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_cover_whole_codec_frames() {
        assert_eq!(packet_samples(CodecFormat::Ulaw, CodecFormat::G729a), 160);
        assert_eq!(packet_samples(CodecFormat::Slin, CodecFormat::G723), 240);
        assert_eq!(CodecFormat::G723.bytes_for(240), 24);
    }

    #[test]
    fn output_reports_overall_status() {
        let output = SelftestOutput {
            schema_id: schema_id("selftest-report"),
            checks: vec![CheckResult::from_result("x", Err("boom".to_string()))],
            overall: "fail",
        };
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("\"overall\":\"fail\""));
        assert!(json.contains("\"status\":\"fail\""));
    }
}
