//! Command-line tool for the Buxton configuration database.
//!
//! `buxtonctl` talks to the daemon over its socket by default; with
//! `--direct` it opens the layer databases in-process, which is reserved
//! for root.

pub mod cli;
pub mod commands;
pub mod errors;

pub use cli::{Cli, Command};
pub use commands::{Session, run};
pub use errors::AppError;
