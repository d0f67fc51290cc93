use crate::cmd::envinfo::target_triple;
use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("dsplink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: dsplink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target: {}", target_triple());
    println!("rustc: {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("backend: emulator");

    Ok(SUCCESS)
}
