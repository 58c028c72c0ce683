//! Entry point: parse arguments, build a validated `Config`, run the
//! orchestrator, and translate any error into the right process exit code
//! (spec §6, §7).

use clap::Parser;
use log::error;

use baseband_bootloader::config::{Cli, Config};
use baseband_bootloader::error::CoreError;
use baseband_bootloader::orchestrator::Orchestrator;

fn main() {
    env_logger::init();

    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), CoreError> {
    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    let orchestrator = Orchestrator::new(&config)?;
    orchestrator.run()
}
