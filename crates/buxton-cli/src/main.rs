use std::process::ExitCode;

use clap::Parser;

use buxton_cli::{Cli, run};
use buxton_config::LogFormat;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(error) = buxton_config::init_logging("warn", LogFormat::Compact) {
        eprintln!("failed to initialise logging: {error}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("buxtonctl: {error}");
            ExitCode::FAILURE
        }
    }
}
