//! The daemon proper: readiness loop, request dispatch and notification
//! fanout.
//!
//! A single thread drives one `poll(2)` loop over three kinds of source:
//! the listening sockets, the connected clients, and the access-control
//! rule watch. No request blocks; reads and writes are non-blocking and
//! every backend call is treated as one atomic step of the loop. Within a
//! client connection requests are processed strictly in order and
//! responses queue in request order; `CHANGED` frames for other clients
//! are serialized through the same per-client write queues.

use std::io::Write;
use std::os::fd::{AsFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{setsockopt, sockopt};
use thiserror::Error;
use tracing::{debug, info, warn};

use buxton_config::{
    ConfigError, default_config_path, default_db_root, default_smack_rules_path,
    load_layer_configs, socket_path,
};
use buxton_direct::{
    AccessMode, BackendRegistry, Caller, Control, DirectError, Fanout, SmackCache,
};
use buxton_proto::{
    Direction, Key, KeyError, Label, MAX_PARAMS, Message, MessageType, Param, Status, Value,
    decode, encode, peek_size,
};

use crate::clients::{Client, ClientTable};
use crate::listener::{DaemonListener, ListenerError, acquire_listeners};
use crate::notify::{Notifier, Subscription};

const DAEMON_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::daemon");

/// Priority applied to accepted client sockets.
const SOCKET_PRIORITY: i32 = 6;

/// How long one poll cycle may sleep before re-checking shutdown.
const POLL_INTERVAL_MS: u16 = 500;

/// Daemon construction and runtime options.
///
/// Every path is injectable so tests run against scratch directories; the
/// defaults are the well-known system locations.
#[derive(Debug, Clone)]
pub struct Options {
    /// Layer-configuration file.
    pub config_path: Utf8PathBuf,
    /// Root directory for persistent layer databases.
    pub db_root: Utf8PathBuf,
    /// Listening socket path for the manual-bind path.
    pub socket_path: Utf8PathBuf,
    /// Access-control rule list to cache and watch.
    pub smack_rules: Utf8PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            db_root: default_db_root(),
            socket_path: socket_path(),
            smack_rules: default_smack_rules_path(),
        }
    }
}

/// Errors that abort daemon startup or the event loop.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The layer configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No listening socket could be acquired.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// The poller itself failed.
    #[error("poll failed: {0}")]
    Poll(nix::Error),
}

/// Failures local to one request; each terminates as a status frame.
#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Direct(#[from] DirectError),
    #[error("request rejected: {0}")]
    Request(Status),
}

impl DispatchError {
    fn status(&self) -> Status {
        match self {
            Self::Direct(error) => error.status(),
            Self::Request(status) => *status,
        }
    }
}

impl From<KeyError> for DispatchError {
    fn from(_: KeyError) -> Self {
        Self::Request(Status::BadArgs)
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Listener(usize),
    RuleWatch,
    Client(RawFd),
}

/// The daemon: owns the layers, backends, rule cache, listeners, client
/// table and subscription registry. One instance per process; tests build
/// their own against scratch paths.
pub struct Daemon {
    options: Options,
    control: Control,
    listeners: Vec<DaemonListener>,
    clients: ClientTable,
    notifier: Notifier,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    /// Loads the layer configuration and acquires listeners.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError`] when the configuration is unreadable or no
    /// listening socket can be acquired.
    pub fn new(options: Options) -> Result<Self, DaemonError> {
        let layers = load_layer_configs(&options.config_path)?;
        let control = Control::open(
            layers,
            BackendRegistry::new(options.db_root.clone()),
            SmackCache::load(options.smack_rules.clone()),
        );
        let listeners = acquire_listeners(&options.socket_path)?;
        Ok(Self {
            options,
            control,
            listeners,
            clients: ClientTable::new(),
            notifier: Notifier::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the flag that stops [`Daemon::run`] when set.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the event loop until the shutdown flag is set.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Poll`] when the poller fails, which is
    /// unrecoverable.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        info!(
            target: DAEMON_TARGET,
            socket = %self.options.socket_path,
            layers = self.control.layers().len(),
            "daemon started"
        );
        while !self.shutdown.load(Ordering::SeqCst) {
            self.poll_once(PollTimeout::from(POLL_INTERVAL_MS))?;
        }
        info!(target: DAEMON_TARGET, "daemon stopping");
        self.close();
        Ok(())
    }

    /// Tears down every client and backend. Safe to call repeatedly.
    pub fn close(&mut self) {
        for fd in self.clients.fds() {
            self.evict(fd);
        }
        self.control.close();
    }

    /// Performs one poll cycle: accept, read, dispatch, write, reload.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Poll`] when the poller fails.
    pub fn poll_once(&mut self, timeout: PollTimeout) -> Result<(), DaemonError> {
        let mut ready: Vec<(Source, PollFlags)> = Vec::new();
        {
            let mut sources = Vec::new();
            let mut pollfds: Vec<PollFd<'_>> = Vec::new();

            for (index, listener) in self.listeners.iter().enumerate() {
                sources.push(Source::Listener(index));
                pollfds.push(PollFd::new(
                    listener.as_fd(),
                    PollFlags::POLLIN | PollFlags::POLLPRI,
                ));
            }
            for client in self.clients.iter() {
                let mut interest = PollFlags::POLLIN | PollFlags::POLLPRI;
                if client.has_pending_writes() {
                    interest |= PollFlags::POLLOUT;
                }
                sources.push(Source::Client(client.fd()));
                pollfds.push(PollFd::new(client.stream().as_fd(), interest));
            }
            match self.control.smack_mut().watch_fd() {
                Ok(fd) => {
                    sources.push(Source::RuleWatch);
                    pollfds.push(PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLPRI));
                }
                Err(error) => {
                    debug!(target: DAEMON_TARGET, %error, "rule watch unavailable");
                }
            }

            let count = poll(&mut pollfds, timeout).map_err(DaemonError::Poll)?;
            if count > 0 {
                for (pollfd, source) in pollfds.iter().zip(&sources) {
                    if let Some(revents) = pollfd.revents()
                        && !revents.is_empty()
                    {
                        ready.push((*source, revents));
                    }
                }
            }
        }

        for (source, revents) in ready {
            match source {
                Source::Listener(index) => self.accept_clients(index),
                Source::RuleWatch => self.reload_rules(),
                Source::Client(fd) => self.service_client(fd, revents),
            }
        }
        Ok(())
    }

    fn accept_clients(&mut self, index: usize) {
        loop {
            match self.listeners[index].accept() {
                Ok(Some(stream)) => {
                    if let Err(error) = stream.set_nonblocking(true) {
                        warn!(target: DAEMON_TARGET, %error, "failed to unblock client socket");
                        continue;
                    }
                    if let Err(error) = setsockopt(&stream, sockopt::Priority, &SOCKET_PRIORITY) {
                        // Not fatal: the connection merely loses its boost.
                        debug!(target: DAEMON_TARGET, %error, "failed to raise socket priority");
                    }
                    match Client::accept(stream) {
                        Ok(client) => {
                            self.clients.insert(client);
                        }
                        Err(error) => {
                            warn!(target: DAEMON_TARGET, %error, "rejecting credential-less client");
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(target: DAEMON_TARGET, %error, "accept failed");
                    break;
                }
            }
        }
    }

    fn reload_rules(&mut self) {
        match self.control.smack_mut().reload() {
            Ok(()) => info!(target: DAEMON_TARGET, "access rules reloaded"),
            Err(error) => warn!(target: DAEMON_TARGET, %error, "access rule reload failed"),
        }
        self.control.smack_mut().drain_watch();
    }

    fn service_client(&mut self, fd: RawFd, revents: PollFlags) {
        let broken = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        if revents.intersects(broken) && !revents.intersects(PollFlags::POLLIN) {
            self.evict(fd);
            return;
        }
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) && !self.read_client(fd) {
            return;
        }
        if revents.contains(PollFlags::POLLOUT) {
            self.write_client(fd);
        }
    }

    /// Reads, frames and dispatches everything the client has sent.
    /// Returns `false` when the client was evicted.
    fn read_client(&mut self, fd: RawFd) -> bool {
        let open = {
            let Some(client) = self.clients.get_mut(fd) else {
                return false;
            };
            match client.drain_socket() {
                Ok(open) => open,
                Err(error) => {
                    warn!(target: DAEMON_TARGET, fd, %error, "read failed");
                    self.evict(fd);
                    return false;
                }
            }
        };

        loop {
            let frame = {
                let Some(client) = self.clients.get_mut(fd) else {
                    return false;
                };
                match peek_size(client.buffered()) {
                    Err(error) => {
                        warn!(target: DAEMON_TARGET, fd, %error, "corrupt frame header");
                        self.reject_corrupt(fd);
                        return false;
                    }
                    Ok(None) => break,
                    Ok(Some(total)) if client.buffered().len() < total => break,
                    Ok(Some(total)) => {
                        // The kernel may have relabelled the peer since the
                        // last message.
                        client.refresh_label();
                        client.take_frame(total)
                    }
                }
            };

            match decode(&frame, Direction::Request) {
                Ok(message) => self.dispatch(fd, message),
                Err(error) => {
                    warn!(target: DAEMON_TARGET, fd, %error, "corrupt frame");
                    self.reject_corrupt(fd);
                    return false;
                }
            }
        }

        if !open {
            debug!(target: DAEMON_TARGET, fd, "client closed the connection");
            // A half-closed peer may still be reading replies.
            self.write_client(fd);
            self.evict(fd);
            return false;
        }

        // Flush opportunistically so a simple request/response round trip
        // does not wait for another poll cycle.
        self.write_client(fd);
        self.clients.get_mut(fd).is_some()
    }

    fn write_client(&mut self, fd: RawFd) {
        let Some(client) = self.clients.get_mut(fd) else {
            return;
        };
        if let Err(error) = client.flush() {
            warn!(target: DAEMON_TARGET, fd, %error, "write failed");
            self.evict(fd);
        }
    }

    /// Best-effort `MessageCorrupt` status, then eviction. The reply uses
    /// msgid 0 because the offending frame never yielded one.
    fn reject_corrupt(&mut self, fd: RawFd) {
        if let Some(client) = self.clients.get_mut(fd) {
            let notice = Message::new(
                MessageType::Status,
                0,
                vec![status_param(Status::MessageCorrupt)],
            );
            if let Ok(frame) = encode(&notice) {
                let mut stream = client.stream();
                let _ = stream.write_all(&frame);
            }
        }
        self.evict(fd);
    }

    fn evict(&mut self, fd: RawFd) {
        let Some(client) = self.clients.remove(fd) else {
            return;
        };
        for (group, name) in client.subscriptions() {
            self.notifier.unsubscribe(group, name.as_deref(), fd);
        }
        // The socket closes when `client` drops here.
    }

    fn dispatch(&mut self, fd: RawFd, message: Message) {
        let caller = {
            let Some(client) = self.clients.get_mut(fd) else {
                return;
            };
            Caller {
                uid: client.credentials().uid,
                label: client.label().cloned(),
            }
        };

        debug!(
            target: DAEMON_TARGET,
            fd,
            msgid = message.msgid,
            kind = %message.msg_type,
            "dispatching request"
        );

        let msgid = message.msgid;
        let (params, fanouts) = match self.try_execute(fd, &caller, &message) {
            Ok(outcome) => outcome,
            Err(error) => {
                debug!(target: DAEMON_TARGET, fd, msgid, %error, "request failed");
                (vec![status_param(error.status())], Vec::new())
            }
        };

        let reply = Message::new(MessageType::Status, msgid, params);
        match encode(&reply) {
            Ok(frame) => {
                if let Some(client) = self.clients.get_mut(fd) {
                    client.enqueue(frame);
                }
            }
            Err(error) => {
                warn!(target: DAEMON_TARGET, fd, msgid, %error, "failed to encode reply");
            }
        }

        for fanout in &fanouts {
            self.fan_out(fanout);
        }
    }

    fn try_execute(
        &mut self,
        fd: RawFd,
        caller: &Caller,
        message: &Message,
    ) -> Result<(Vec<Param>, Vec<Fanout>), DispatchError> {
        let params = &message.params;
        match message.msg_type {
            MessageType::Set => {
                if params.len() != 4 {
                    return Err(DispatchError::Request(Status::BadArgs));
                }
                let [layer, group, name] = string_args::<3>(&params[..3])?;
                let key = Key::new(Some(layer), group, Some(name))?;
                let fanout = self.control.set(caller, &key, params[3].value.clone())?;
                Ok((vec![status_param(Status::Ok)], vec![fanout]))
            }
            MessageType::Get => {
                let key = match params.len() {
                    2 => {
                        let [group, name] = string_args::<2>(params)?;
                        Key::new(None::<&str>, group, Some(name))?
                    }
                    3 => {
                        let [layer, group, name] = string_args::<3>(params)?;
                        Key::new(Some(layer), group, Some(name))?
                    }
                    _ => return Err(DispatchError::Request(Status::BadArgs)),
                };
                let record = self.control.get(caller, &key)?;
                Ok((
                    vec![
                        status_param(Status::Ok),
                        Param::new(record.label, record.value),
                    ],
                    Vec::new(),
                ))
            }
            MessageType::Unset => {
                let [layer, group, name] = string_args::<3>(params)?;
                let key = Key::new(Some(layer), group, Some(name))?;
                let fanout = self.control.unset(caller, &key)?;
                Ok((vec![status_param(Status::Ok)], vec![fanout]))
            }
            MessageType::CreateGroup => {
                let [layer, group] = string_args::<2>(params)?;
                let key = Key::new(Some(layer), group, None::<&str>)?;
                let fanout = self
                    .control
                    .create_group(caller, &key, caller.label.clone())?;
                Ok((vec![status_param(Status::Ok)], vec![fanout]))
            }
            MessageType::RemoveGroup => {
                let [layer, group] = string_args::<2>(params)?;
                let key = Key::new(Some(layer), group, None::<&str>)?;
                let fanouts = self.control.remove_group(caller, &key)?;
                Ok((vec![status_param(Status::Ok)], fanouts))
            }
            MessageType::SetLabel => {
                let (key, label) = match params.len() {
                    3 => {
                        let [layer, group, label] = string_args::<3>(params)?;
                        (Key::new(Some(layer), group, None::<&str>)?, label)
                    }
                    4 => {
                        let [layer, group, name, label] = string_args::<4>(params)?;
                        (Key::new(Some(layer), group, Some(name))?, label)
                    }
                    _ => return Err(DispatchError::Request(Status::BadArgs)),
                };
                let label =
                    Label::new(label).map_err(|_| DispatchError::Request(Status::BadArgs))?;
                self.control.set_label(caller, &key, label)?;
                Ok((vec![status_param(Status::Ok)], Vec::new()))
            }
            MessageType::List => {
                let [layer] = string_args::<1>(params)?;
                let keys = self.control.list(caller, layer)?;
                if keys.len() + 1 > MAX_PARAMS {
                    return Err(DispatchError::Request(Status::ExceededMaxParams));
                }
                let mut reply = vec![status_param(Status::Ok)];
                reply.extend(
                    keys.into_iter()
                        .map(|key| Param::plain(Value::String(key.to_string()))),
                );
                Ok((reply, Vec::new()))
            }
            MessageType::Notify => {
                let (group, name) = watch_target(params)?;
                let accepted = self.notifier.subscribe(
                    group,
                    name,
                    Subscription {
                        fd,
                        msgid: message.msgid,
                    },
                );
                if !accepted {
                    return Err(DispatchError::Request(Status::AlreadyExists));
                }
                if let Some(client) = self.clients.get_mut(fd) {
                    client.track_subscription(group.to_string(), name.map(str::to_string));
                }
                Ok((vec![status_param(Status::Ok)], Vec::new()))
            }
            MessageType::Unnotify => {
                let (group, name) = watch_target(params)?;
                let removed = self
                    .notifier
                    .unsubscribe(group, name, fd)
                    .ok_or(DispatchError::Request(Status::NotFound))?;
                if let Some(client) = self.clients.get_mut(fd) {
                    client.untrack_subscription(group, name);
                }
                let key_display = match name {
                    Some(name) => format!("{group}:{name}"),
                    None => group.to_string(),
                };
                Ok((
                    vec![
                        status_param(Status::Ok),
                        Param::plain(Value::String(key_display)),
                        Param::plain(Value::Uint64(removed)),
                    ],
                    Vec::new(),
                ))
            }
            // The decoder's direction check leaves these unreachable.
            MessageType::Status | MessageType::Changed => {
                Err(DispatchError::Request(Status::InvalidControlField))
            }
        }
    }

    /// Delivers one change record to every matching subscriber whose label
    /// may read the new value.
    fn fan_out(&mut self, fanout: &Fanout) {
        let subscribers = self
            .notifier
            .subscribers(&fanout.group, fanout.name.as_deref());
        if subscribers.is_empty() {
            return;
        }

        let key_name = fanout
            .name
            .clone()
            .unwrap_or_else(|| fanout.group.clone());

        for subscription in subscribers {
            let Some(client) = self.clients.get_mut(subscription.fd) else {
                continue;
            };
            if let (Some(subscriber_label), Some((_, new_label))) =
                (client.label(), &fanout.change)
                && !self
                    .control
                    .smack()
                    .may_access(subscriber_label, new_label, AccessMode::Read)
            {
                debug!(
                    target: DAEMON_TARGET,
                    fd = subscription.fd,
                    key = %key_name,
                    "change withheld from subscriber"
                );
                continue;
            }

            let mut params = vec![Param::plain(Value::String(key_name.clone()))];
            if let Some((value, label)) = &fanout.change {
                params.push(Param::new(label.clone(), value.clone()));
            }
            let changed = Message::new(MessageType::Changed, subscription.msgid, params);
            match encode(&changed) {
                Ok(frame) => client.enqueue(frame),
                Err(error) => {
                    warn!(target: DAEMON_TARGET, %error, "failed to encode change frame");
                }
            }
        }
    }
}

fn status_param(status: Status) -> Param {
    Param::plain(Value::Int32(status.code()))
}

/// Extracts exactly `N` string parameters.
fn string_args<const N: usize>(params: &[Param]) -> Result<[&str; N], DispatchError> {
    if params.len() != N {
        return Err(DispatchError::Request(Status::BadArgs));
    }
    let mut out = [""; N];
    for (slot, param) in out.iter_mut().zip(params) {
        *slot = param
            .value
            .as_str()
            .ok_or(DispatchError::Request(Status::InvalidType))?;
    }
    Ok(out)
}

/// Extracts the `(group, name?)` target of a notify or unnotify request.
fn watch_target(params: &[Param]) -> Result<(&str, Option<&str>), DispatchError> {
    match params.len() {
        1 => {
            let [group] = string_args::<1>(params)?;
            Ok((group, None))
        }
        2 => {
            let [group, name] = string_args::<2>(params)?;
            Ok((group, Some(name)))
        }
        _ => Err(DispatchError::Request(Status::BadArgs)),
    }
}
