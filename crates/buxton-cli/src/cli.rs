//! Command-line argument definitions for `buxtonctl`.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

use buxton_proto::DataType;

/// Command-line interface for the Buxton configuration database.
#[derive(Debug, Parser)]
#[command(name = "buxtonctl", version, about)]
pub struct Cli {
    /// Operate on the database in-process instead of through the daemon.
    /// Requires root.
    #[arg(long, global = true)]
    pub direct: bool,
    /// Layer-configuration file (direct mode).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<Utf8PathBuf>,
    /// Database root directory (direct mode).
    #[arg(long, global = true, value_name = "DIR")]
    pub db_root: Option<Utf8PathBuf>,
    /// Daemon socket path.
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<Utf8PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

/// One `buxtonctl` operation.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Retrieve a string value.
    GetString(GetArgs),
    /// Retrieve an int32 value.
    GetInt32(GetArgs),
    /// Retrieve a uint32 value.
    GetUint32(GetArgs),
    /// Retrieve an int64 value.
    GetInt64(GetArgs),
    /// Retrieve a uint64 value.
    GetUint64(GetArgs),
    /// Retrieve a float value.
    GetFloat(GetArgs),
    /// Retrieve a double value.
    GetDouble(GetArgs),
    /// Retrieve a boolean value.
    GetBool(GetArgs),
    /// Set a string value.
    SetString(SetArgs),
    /// Set an int32 value.
    SetInt32(SetArgs),
    /// Set a uint32 value.
    SetUint32(SetArgs),
    /// Set an int64 value.
    SetInt64(SetArgs),
    /// Set a uint64 value.
    SetUint64(SetArgs),
    /// Set a float value.
    SetFloat(SetArgs),
    /// Set a double value.
    SetDouble(SetArgs),
    /// Set a boolean value.
    SetBool(SetArgs),
    /// Remove a single value.
    UnsetValue(UnsetArgs),
    /// Print the label on a group or value.
    GetLabel(GetLabelArgs),
    /// Replace the label on a group or value.
    SetLabel(SetLabelArgs),
    /// Create a group.
    CreateGroup(CreateGroupArgs),
    /// Remove a group and every key beneath it.
    RemoveGroup(GroupArgs),
    /// List the keys of a layer.
    ListKeys(ListArgs),
}

impl Command {
    /// Returns the value type a typed get/set subcommand operates on.
    #[must_use]
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::GetString(_) | Self::SetString(_) => Some(DataType::String),
            Self::GetInt32(_) | Self::SetInt32(_) => Some(DataType::Int32),
            Self::GetUint32(_) | Self::SetUint32(_) => Some(DataType::Uint32),
            Self::GetInt64(_) | Self::SetInt64(_) => Some(DataType::Int64),
            Self::GetUint64(_) | Self::SetUint64(_) => Some(DataType::Uint64),
            Self::GetFloat(_) | Self::SetFloat(_) => Some(DataType::Float),
            Self::GetDouble(_) | Self::SetDouble(_) => Some(DataType::Double),
            Self::GetBool(_) | Self::SetBool(_) => Some(DataType::Boolean),
            _ => None,
        }
    }
}

/// Target of a typed read.
#[derive(Debug, Args)]
pub struct GetArgs {
    /// Read from this layer only; omit to resolve across layers.
    #[arg(long, value_name = "LAYER")]
    pub layer: Option<String>,
    /// Group holding the value.
    pub group: String,
    /// Name of the value.
    pub name: String,
}

/// Target and payload of a typed write.
#[derive(Debug, Args)]
pub struct SetArgs {
    /// Layer to write into.
    pub layer: String,
    /// Group holding the value.
    pub group: String,
    /// Name of the value.
    pub name: String,
    /// New value, parsed as the subcommand's type.
    pub value: String,
}

/// Target of a value removal.
#[derive(Debug, Args)]
pub struct UnsetArgs {
    /// Layer to remove from.
    pub layer: String,
    /// Group holding the value.
    pub group: String,
    /// Name of the value.
    pub name: String,
}

/// Target of a label read.
#[derive(Debug, Args)]
pub struct GetLabelArgs {
    /// Read from this layer only; omit to resolve across layers.
    #[arg(long, value_name = "LAYER")]
    pub layer: Option<String>,
    /// Group to inspect.
    pub group: String,
    /// Value to inspect; omit for the group itself.
    pub name: Option<String>,
}

/// Target and payload of a label replacement.
#[derive(Debug, Args)]
pub struct SetLabelArgs {
    /// Layer holding the target.
    pub layer: String,
    /// Group to relabel.
    pub group: String,
    /// The new label.
    pub label: String,
    /// Relabel this value instead of the group itself.
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,
}

/// Target of a group creation.
#[derive(Debug, Args)]
pub struct CreateGroupArgs {
    /// Layer to create the group in.
    pub layer: String,
    /// Name of the new group.
    pub group: String,
    /// Label for the new group; defaults to the floor label.
    #[arg(long, value_name = "LABEL")]
    pub label: Option<String>,
}

/// Target of a group removal.
#[derive(Debug, Args)]
pub struct GroupArgs {
    /// Layer holding the group.
    pub layer: String,
    /// Name of the group.
    pub group: String,
}

/// Layer whose keys to enumerate.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Layer to enumerate.
    pub layer: String,
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_typed_set() {
        let cli = Cli::parse_from(["buxtonctl", "set-int32", "base", "net", "mtu", "1500"]);
        assert_eq!(cli.command.data_type(), Some(DataType::Int32));
        let Command::SetInt32(args) = cli.command else {
            panic!("expected set-int32");
        };
        assert_eq!(args.layer, "base");
        assert_eq!(args.group, "net");
        assert_eq!(args.name, "mtu");
        assert_eq!(args.value, "1500");
    }

    #[test]
    fn get_layer_is_optional() {
        let cli = Cli::parse_from(["buxtonctl", "get-string", "net", "hostname"]);
        let Command::GetString(args) = cli.command else {
            panic!("expected get-string");
        };
        assert_eq!(args.layer, None);

        let cli = Cli::parse_from([
            "buxtonctl",
            "get-string",
            "--layer",
            "base",
            "net",
            "hostname",
        ]);
        let Command::GetString(args) = cli.command else {
            panic!("expected get-string");
        };
        assert_eq!(args.layer.as_deref(), Some("base"));
    }

    #[test]
    fn direct_flag_is_global() {
        let cli = Cli::parse_from(["buxtonctl", "list-keys", "base", "--direct"]);
        assert!(cli.direct);
    }

    #[rstest]
    #[case::missing_value(&["buxtonctl", "set-int32", "base", "net", "mtu"])]
    #[case::unknown_subcommand(&["buxtonctl", "set-int128", "base", "net", "mtu", "1"])]
    #[case::missing_layer(&["buxtonctl", "unset-value", "net"])]
    fn rejects_malformed_invocations(#[case] argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn set_label_targets_the_group_by_default() {
        let cli = Cli::parse_from(["buxtonctl", "set-label", "base", "net", "System"]);
        let Command::SetLabel(args) = cli.command else {
            panic!("expected set-label");
        };
        assert_eq!(args.label, "System");
        assert_eq!(args.name, None);
    }
}
