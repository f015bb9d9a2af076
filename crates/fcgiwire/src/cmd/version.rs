use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("fcgiwire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: fcgiwire");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol: FastCGI/1");
    println!(
        "target: {}",
        option_env!("FCGIWIRE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "features: mux={}, async={}, cli=true",
        cfg!(feature = "mux"),
        cfg!(feature = "async")
    );

    Ok(SUCCESS)
}
