//! Configuration surface shared by the Buxton daemon, client library and CLI.
//!
//! The crate owns three concerns: the layer-configuration file format and its
//! parser, the well-known filesystem locations the daemon and clients agree
//! on, and the logging bootstrap used by the binaries.

mod defaults;
mod layers;
mod logging;

pub use defaults::{
    ROOT_CHECK_ENV, default_config_path, default_db_root, default_smack_rules_path, socket_path,
};
pub use layers::{BackendKind, ConfigError, LayerConfig, LayerKind, load_layer_configs,
    parse_layer_configs};
pub use logging::{LogFormat, LoggingError, init_logging};
