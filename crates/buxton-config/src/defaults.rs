//! Well-known filesystem locations.
//!
//! The socket path is a compile-time constant shared by the daemon, the
//! client library and the CLI. The remaining locations are defaults only;
//! the daemon accepts overrides so tests can run against scratch
//! directories.

use camino::Utf8PathBuf;

/// Environment variable that disables the uid==0 requirement on
/// system-layer mutations. Test and debug use only.
pub const ROOT_CHECK_ENV: &str = "BUXTON_ROOT_CHECK";

const SOCKET_PATH: &str = "/run/buxton-0";
const CONFIG_PATH: &str = "/etc/buxton/buxton.conf";
const DB_ROOT: &str = "/var/lib/buxton";
const SMACK_RULES_PATH: &str = "/sys/fs/smackfs/load2";

/// The well-known daemon socket path.
#[must_use]
pub fn socket_path() -> Utf8PathBuf {
    Utf8PathBuf::from(SOCKET_PATH)
}

/// Default location of the layer-configuration file.
#[must_use]
pub fn default_config_path() -> Utf8PathBuf {
    Utf8PathBuf::from(CONFIG_PATH)
}

/// Default root directory for persistent layer databases.
#[must_use]
pub fn default_db_root() -> Utf8PathBuf {
    Utf8PathBuf::from(DB_ROOT)
}

/// Default location of the kernel's Smack rule list.
#[must_use]
pub fn default_smack_rules_path() -> Utf8PathBuf {
    Utf8PathBuf::from(SMACK_RULES_PATH)
}
