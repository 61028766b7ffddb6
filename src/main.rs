use std::env;
use std::path::PathBuf;
use std::process;

use clap::Parser;

mod config;
mod constants;
mod input;
mod runtime;
mod script;
mod udev;

use runtime::Rt;

#[derive(Parser)]
#[command(name = constants::PROGRAM, version, about = "Scriptable input remapping and bridging daemon")]
struct Args {
    /// Lua script declaring inputs, outputs and callbacks.
    script: PathBuf,
}

fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env::set_var("RUST_LOG", log_level);
    env_logger::init();
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args = Args::parse();
    log::info!("starting {} v{VERSION}", constants::PROGRAM);

    let rt = match Rt::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = script::register(&rt) {
        log::error!("failed to register script module: {e}");
        process::exit(1);
    }

    // The script drives everything from here; it normally blocks inside
    // aelkey.start() until shutdown.
    if let Err(e) = script::run_file(&rt, &args.script) {
        log::error!("{e}");
        process::exit(1);
    }

    log::info!("{} stopped", constants::PROGRAM);
    process::exit(0);
}
