//! Command execution over either transport.
//!
//! Every subcommand runs against a [`Session`]: a socket connection to the
//! daemon, or in direct mode an in-process [`Control`] over the same layer
//! configuration. Direct mode is restricted to root, matching the
//! daemon's own system-layer rule (and honouring the same environment
//! override, so test harnesses can exercise it unprivileged).

use std::env;

use camino::Utf8PathBuf;

use buxton::{Client, Status};
use buxton_config::{ROOT_CHECK_ENV, load_layer_configs};
use buxton_direct::{BackendRegistry, Caller, Control, SmackCache};
use buxton_proto::{DataType, Key, Label, Value};

use crate::cli::{Cli, Command};
use crate::errors::AppError;

/// A connected execution target for subcommands.
pub enum Session {
    /// Requests travel over the daemon socket.
    Socket(Client),
    /// Requests run in-process against the layer databases.
    Direct(Box<DirectSession>),
}

/// The direct path: an in-process control plus the calling identity.
pub struct DirectSession {
    control: Control,
    caller: Caller,
}

impl Session {
    /// Opens the session the invocation asked for.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] when direct mode is requested without root,
    /// the configuration cannot be loaded, or the daemon is unreachable.
    pub fn open(cli: &Cli) -> Result<Self, AppError> {
        if cli.direct {
            let uid = nix::unistd::geteuid().as_raw();
            if uid != 0 && !root_check_disabled() {
                return Err(AppError::DirectRequiresRoot);
            }
            let config_path = cli
                .config
                .clone()
                .unwrap_or_else(buxton_config::default_config_path);
            let db_root = cli
                .db_root
                .clone()
                .unwrap_or_else(buxton_config::default_db_root);
            let layers = load_layer_configs(&config_path)?;
            let control = Control::open(
                layers,
                BackendRegistry::new(db_root),
                SmackCache::load(buxton_config::default_smack_rules_path()),
            );
            return Ok(Self::Direct(Box::new(DirectSession {
                control,
                caller: Caller::direct(uid),
            })));
        }

        let socket: Utf8PathBuf = cli
            .socket
            .clone()
            .unwrap_or_else(buxton_config::socket_path);
        Ok(Self::Socket(Client::connect_to(&socket)?))
    }

    fn get_record(&mut self, key: &Key) -> Result<(Value, Label), AppError> {
        match self {
            Self::Socket(client) => {
                let (status, record) = client.get_record_sync(key)?;
                expect_ok(status)?;
                record.ok_or(AppError::Daemon(Status::Failed))
            }
            Self::Direct(session) => {
                let record = session.control.get(&session.caller, key)?;
                Ok((record.value, record.label))
            }
        }
    }

    fn set(&mut self, key: &Key, value: Value) -> Result<(), AppError> {
        match self {
            Self::Socket(client) => expect_ok(client.set_value_sync(key, value)?),
            Self::Direct(session) => {
                session.control.set(&session.caller, key, value)?;
                Ok(())
            }
        }
    }

    fn unset(&mut self, key: &Key) -> Result<(), AppError> {
        match self {
            Self::Socket(client) => expect_ok(client.unset_value_sync(key)?),
            Self::Direct(session) => {
                session.control.unset(&session.caller, key)?;
                Ok(())
            }
        }
    }

    fn create_group(&mut self, key: &Key, label: Option<Label>) -> Result<(), AppError> {
        match self {
            Self::Socket(client) => expect_ok(client.create_group_sync(key)?),
            Self::Direct(session) => {
                session.control.create_group(&session.caller, key, label)?;
                Ok(())
            }
        }
    }

    fn remove_group(&mut self, key: &Key) -> Result<(), AppError> {
        match self {
            Self::Socket(client) => expect_ok(client.remove_group_sync(key)?),
            Self::Direct(session) => {
                session.control.remove_group(&session.caller, key)?;
                Ok(())
            }
        }
    }

    fn set_label(&mut self, key: &Key, label: &Label) -> Result<(), AppError> {
        match self {
            Self::Socket(client) => expect_ok(client.set_label_sync(key, label)?),
            Self::Direct(session) => {
                session
                    .control
                    .set_label(&session.caller, key, label.clone())?;
                Ok(())
            }
        }
    }

    fn list_keys(&mut self, layer: &str) -> Result<Vec<String>, AppError> {
        match self {
            Self::Socket(client) => {
                let (status, keys) = client.list_keys_sync(layer)?;
                expect_ok(status)?;
                Ok(keys)
            }
            Self::Direct(session) => Ok(session
                .control
                .list(&session.caller, layer)?
                .into_iter()
                .map(|key| key.to_string())
                .collect()),
        }
    }
}

/// Executes one parsed invocation, writing results to stdout.
///
/// # Errors
///
/// Returns [`AppError`] when the operation fails; the caller maps this to
/// a non-zero exit code.
pub fn run(cli: Cli) -> Result<(), AppError> {
    let mut session = Session::open(&cli)?;
    let data_type = cli.command.data_type();

    match cli.command {
        Command::GetString(args)
        | Command::GetInt32(args)
        | Command::GetUint32(args)
        | Command::GetInt64(args)
        | Command::GetUint64(args)
        | Command::GetFloat(args)
        | Command::GetDouble(args)
        | Command::GetBool(args) => {
            let key = Key::new(args.layer.as_deref(), args.group, Some(args.name))?;
            let (value, _) = session.get_record(&key)?;
            let Some(expected) = data_type else {
                return Ok(());
            };
            if value.data_type() != expected {
                return Err(AppError::Daemon(Status::InvalidType));
            }
            println!("{value}");
        }
        Command::SetString(args)
        | Command::SetInt32(args)
        | Command::SetUint32(args)
        | Command::SetInt64(args)
        | Command::SetUint64(args)
        | Command::SetFloat(args)
        | Command::SetDouble(args)
        | Command::SetBool(args) => {
            let key = Key::new(Some(args.layer), args.group, Some(args.name))?;
            let value = Value::parse_as(data_type.unwrap_or(DataType::String), &args.value)?;
            session.set(&key, value)?;
        }
        Command::UnsetValue(args) => {
            let key = Key::new(Some(args.layer), args.group, Some(args.name))?;
            session.unset(&key)?;
        }
        Command::GetLabel(args) => {
            if args.name.is_none() && !cli.direct {
                return Err(AppError::GroupLabelNeedsDirect);
            }
            let key = Key::new(args.layer.as_deref(), args.group, args.name)?;
            let (_, label) = session.get_record(&key)?;
            println!("{label}");
        }
        Command::SetLabel(args) => {
            let key = Key::new(Some(args.layer), args.group, args.name)?;
            let label = Label::new(args.label)?;
            session.set_label(&key, &label)?;
        }
        Command::CreateGroup(args) => {
            let key = Key::new(Some(args.layer), args.group, None::<String>)?;
            let label = args.label.map(Label::new).transpose()?;
            session.create_group(&key, label)?;
        }
        Command::RemoveGroup(args) => {
            let key = Key::new(Some(args.layer), args.group, None::<String>)?;
            session.remove_group(&key)?;
        }
        Command::ListKeys(args) => {
            for key in session.list_keys(&args.layer)? {
                println!("{key}");
            }
        }
    }
    Ok(())
}

fn expect_ok(status: Status) -> Result<(), AppError> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(AppError::Daemon(status))
    }
}

fn root_check_disabled() -> bool {
    env::var(ROOT_CHECK_ENV).is_ok_and(|value| value == "0")
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use serial_test::serial;

    use super::*;
    use crate::cli::Cli;

    const CONFIG: &str = "\
[scratch]
Type = User
Backend = memory
Priority = 1
Description = scratch layer for tests
";

    fn scratch_cli(dir: &tempfile::TempDir, argv: &[&str]) -> Cli {
        let config = dir.path().join("buxton.conf");
        std::fs::write(&config, CONFIG).expect("write config");
        let mut full = vec!["buxtonctl"];
        full.extend_from_slice(argv);
        full.extend_from_slice(&[
            "--direct",
            "--config",
            config.to_str().expect("utf8"),
            "--db-root",
            dir.path().to_str().expect("utf8"),
        ]);
        Cli::parse_from(full)
    }

    #[test]
    #[serial]
    fn direct_mode_requires_root_or_the_override() {
        unsafe { env::remove_var(ROOT_CHECK_ENV) };
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = scratch_cli(&dir, &["list-keys", "scratch"]);
        if nix::unistd::geteuid().is_root() {
            assert!(Session::open(&cli).is_ok());
        } else {
            assert!(matches!(
                Session::open(&cli),
                Err(AppError::DirectRequiresRoot)
            ));
        }
    }

    #[test]
    #[serial]
    fn direct_round_trip_on_a_user_layer() {
        unsafe { env::set_var(ROOT_CHECK_ENV, "0") };
        let dir = tempfile::tempdir().expect("tempdir");

        run(scratch_cli(&dir, &["create-group", "scratch", "app"])).expect("create group");

        // Memory state does not persist across sessions, so the mutation
        // and the read must share one.
        let cli = scratch_cli(&dir, &["list-keys", "scratch"]);
        let mut session = Session::open(&cli).expect("open session");
        let key = Key::new(Some("scratch"), "app", Some("theme")).expect("key");
        session
            .create_group(&Key::new(Some("scratch"), "app", None::<String>).expect("group"), None)
            .expect("create group");
        session
            .set(&key, Value::String("dark".into()))
            .expect("set");
        let (value, label) = session.get_record(&key).expect("get");
        assert_eq!(value, Value::String("dark".into()));
        assert_eq!(label, Label::default());

        let keys = session.list_keys("scratch").expect("list");
        assert_eq!(keys, vec!["app".to_string(), "app:theme".to_string()]);
        unsafe { env::remove_var(ROOT_CHECK_ENV) };
    }
}
