use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use tracing::error;

use buxton_config::LogFormat;
use buxtond::{Daemon, Options};

/// Layered configuration daemon.
#[derive(Debug, Parser)]
#[command(name = "buxtond", version, about)]
struct Args {
    /// Layer-configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<Utf8PathBuf>,
    /// Root directory for persistent layer databases.
    #[arg(long, value_name = "DIR")]
    db_root: Option<Utf8PathBuf>,
    /// Socket path used when no listener is inherited.
    #[arg(long, value_name = "PATH")]
    socket: Option<Utf8PathBuf>,
    /// Access-control rule list to cache and watch.
    #[arg(long, value_name = "PATH")]
    smack_rules: Option<Utf8PathBuf>,
    /// Log filter expression.
    #[arg(long, value_name = "FILTER", default_value = "info")]
    log_filter: String,
    /// Log output format.
    #[arg(long, value_name = "FORMAT", default_value = "compact")]
    log_format: LogFormat,
}

impl Args {
    fn into_options(self) -> Options {
        let defaults = Options::default();
        Options {
            config_path: self.config.unwrap_or(defaults.config_path),
            db_root: self.db_root.unwrap_or(defaults.db_root),
            socket_path: self.socket.unwrap_or(defaults.socket_path),
            smack_rules: self.smack_rules.unwrap_or(defaults.smack_rules),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(error) = buxton_config::init_logging(&args.log_filter, args.log_format) {
        eprintln!("failed to initialise logging: {error}");
        return ExitCode::FAILURE;
    }

    let mut daemon = match Daemon::new(args.into_options()) {
        Ok(daemon) => daemon,
        Err(error) => {
            error!(%error, "daemon startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = daemon.shutdown_handle();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(error) = signal_hook::flag::register(signal, shutdown.clone()) {
            error!(%error, signal, "failed to register signal handler");
            return ExitCode::FAILURE;
        }
    }
    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "daemon terminated");
            ExitCode::FAILURE
        }
    }
}
