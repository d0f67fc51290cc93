use std::collections::BTreeMap;

use dsplink_device::{CodecFormat, DeviceConfig};
use serde::Serialize;

use crate::cmd::EnvinfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, schema_id, OutputFormat};

const ENV_VARS: [&str; 3] = ["DSPLINK_CONFIG", "DSPLINK_LOG_LEVEL", "RUST_LOG"];

#[derive(Serialize)]
struct PlatformInfo {
    os: String,
    arch: String,
}

#[derive(Serialize)]
struct EnvInfoOutput {
    schema_id: String,
    version: String,
    target: String,
    rust_version: String,
    git_hash: String,
    platform: PlatformInfo,
    formats: Vec<CodecFormat>,
    defaults: DeviceConfig,
    environment: BTreeMap<String, Option<String>>,
}

pub fn run(_args: EnvinfoArgs, format: OutputFormat) -> CliResult<i32> {
    let environment = ENV_VARS
        .iter()
        .map(|name| (name.to_string(), std::env::var(name).ok()))
        .collect();

    let output = EnvInfoOutput {
        schema_id: schema_id("envinfo"),
        version: env!("CARGO_PKG_VERSION").to_string(),
        target: target_triple(),
        rust_version: option_env!("RUSTC_VERSION").unwrap_or("unknown").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        platform: PlatformInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        formats: CodecFormat::ALL.to_vec(),
        defaults: DeviceConfig::default(),
        environment,
    };

    print_envinfo(&output, format);
    Ok(SUCCESS)
}

pub(crate) fn target_triple() -> String {
    if let Some(target) = option_env!("DSPLINK_BUILD_TARGET") {
        return target.to_string();
    }

    match (std::env::consts::ARCH, std::env::consts::OS) {
        ("aarch64", "macos") => "aarch64-apple-darwin".to_string(),
        ("x86_64", "macos") => "x86_64-apple-darwin".to_string(),
        ("aarch64", "linux") => "aarch64-unknown-linux-gnu".to_string(),
        ("x86_64", "linux") => "x86_64-unknown-linux-gnu".to_string(),
        (arch, os) => format!("{arch}-unknown-{os}"),
    }
}

fn print_envinfo(output: &EnvInfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("dsplink environment\n");
            println!("  Version:    {}", output.version);
            println!("  Target:     {}", output.target);
            println!("  Rust:       {}", output.rust_version);
            println!("  Git hash:   {}", output.git_hash);
            println!("  Platform:   {} ({})", output.platform.os, output.platform.arch);
            let formats: Vec<&str> = output.formats.iter().map(|f| f.name()).collect();
            println!("  Formats:    {}", formats.join(", "));
            println!("  Pairs:      {}", output.defaults.channels.pairs);
            println!("\n  Environment:");
            for (k, v) in &output.environment {
                println!("    {:<20} {}", k, v.as_deref().unwrap_or("(not set)"));
            }
        }
        OutputFormat::Raw => println!("{}", output.version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envinfo_json_has_schema_id() {
        let out = EnvInfoOutput {
            schema_id: schema_id("envinfo"),
            version: "0.1.0".to_string(),
            target: "a-b-c".to_string(),
            rust_version: "1.81.0".to_string(),
            git_hash: "abc".to_string(),
            platform: PlatformInfo {
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
            },
            formats: vec![CodecFormat::Ulaw],
            defaults: DeviceConfig::default(),
            environment: BTreeMap::new(),
        };

        let json = serde_json::to_string(&out).expect("envinfo output should serialize");
        assert!(json.contains("envinfo.schema.json"));
        assert!(json.contains("\"formats\":[\"ulaw\"]"));
    }

    #[test]
    fn target_looks_like_triple() {
        let target = target_triple();
        assert!(target.split('-').count() >= 3);
    }
}
