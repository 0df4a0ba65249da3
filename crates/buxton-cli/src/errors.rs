//! Error surface for the command-line tool.

use thiserror::Error;

use buxton::ClientError;
use buxton_config::ConfigError;
use buxton_direct::DirectError;
use buxton_proto::{KeyError, Status, WireError};

/// Errors that terminate a `buxtonctl` invocation with a non-zero exit.
#[derive(Debug, Error)]
pub enum AppError {
    /// The daemon reported a non-success status.
    #[error("daemon replied: {0}")]
    Daemon(Status),
    /// Direct mode is restricted to root.
    #[error("--direct requires root")]
    DirectRequiresRoot,
    /// The wire protocol addresses named values; group labels need the
    /// in-process path.
    #[error("group labels are only readable with --direct")]
    GroupLabelNeedsDirect,
    /// The connection or a request to the daemon failed.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// A direct-mode operation failed.
    #[error(transparent)]
    Direct(#[from] DirectError),
    /// The layer configuration could not be loaded in direct mode.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A command argument did not form a valid key.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// A command argument did not parse as the requested value type.
    #[error(transparent)]
    Value(#[from] WireError),
}
