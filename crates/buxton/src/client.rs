//! Connection handling and the asynchronous reply correlator.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::debug;

use buxton_proto::{
    Direction, Key, Label, Message, MessageType, Param, Status, Value, WireError, decode, encode,
    peek_size,
};

use crate::response::Response;

const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::client");

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_POLL_MS: u16 = 5000;

/// Outstanding requests older than this are swept on the next send.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors surfaced by the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon socket could not be reached.
    #[error("failed to connect to '{path}': {source}")]
    Connect {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    /// A socket read or write failed mid-session.
    #[error("socket failure: {0}")]
    Io(#[from] io::Error),
    /// The daemon sent bytes that do not form a valid frame.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The daemon sent a structurally valid frame with an illegal shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The key is missing a component this request requires.
    #[error("key is missing its {0} component")]
    IncompleteKey(&'static str),
    /// A correlation table mutex was poisoned by a panicking thread.
    #[error("correlation table lock poisoned")]
    Lock,
    /// No reply arrived within the synchronous wait window.
    #[error("timed out waiting for the daemon")]
    Timeout,
}

impl ClientError {
    fn lock<T>(_: T) -> Self {
        Self::Lock
    }
}

/// Callback invoked with the acknowledgement of a request and, for
/// notification registrations, every subsequent change.
pub type Callback = Box<dyn FnMut(&Response) + Send>;

struct Pending {
    callback: Callback,
    msg_type: MessageType,
    created: Instant,
}

/// Both correlation tables share one mutex: requests awaiting their
/// acknowledgement, and live notification registrations keyed by the
/// msgid of their `NOTIFY`.
#[derive(Default)]
struct Tables {
    one_shot: HashMap<u64, Pending>,
    subscriptions: HashMap<u64, Callback>,
}

/// One connection to the daemon.
pub struct Client {
    stream: UnixStream,
    msgid: AtomicU64,
    read_buffer: Mutex<Vec<u8>>,
    tables: Mutex<Tables>,
}

impl Client {
    /// Connects to the well-known daemon socket.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] when the daemon is unreachable.
    pub fn connect() -> Result<Self, ClientError> {
        Self::connect_to(&buxton_config::socket_path())
    }

    /// Connects to a daemon at an explicit socket path.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] when the daemon is unreachable.
    pub fn connect_to(path: &Utf8Path) -> Result<Self, ClientError> {
        let connect_error = |source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        };
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(connect_error)?;
        let address = SockAddr::unix(path).map_err(connect_error)?;
        socket
            .connect_timeout(&address, CONNECT_TIMEOUT)
            .map_err(connect_error)?;
        let stream: UnixStream = std::os::fd::OwnedFd::from(socket).into();
        stream.set_nonblocking(true).map_err(connect_error)?;

        Ok(Self {
            stream,
            msgid: AtomicU64::new(1),
            read_buffer: Mutex::new(Vec::new()),
            tables: Mutex::new(Tables::default()),
        })
    }

    /// Returns the socket descriptor for callers running their own poll
    /// loop.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Sets a value. The key must name a layer and a value.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key is incomplete or the send
    /// fails.
    pub fn set_value(
        &self,
        key: &Key,
        value: Value,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let layer = require_layer(key)?;
        let name = require_name(key)?;
        self.send(
            MessageType::Set,
            vec![
                string_param(layer),
                string_param(key.group_name()),
                string_param(name),
                Param::plain(value),
            ],
            Box::new(callback),
        )
    }

    /// Retrieves a value. Omitting the key's layer asks the daemon to
    /// resolve across layers.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key is incomplete or the send
    /// fails.
    pub fn get_value(
        &self,
        key: &Key,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let name = require_name(key)?;
        let mut params = Vec::new();
        if let Some(layer) = key.layer() {
            params.push(string_param(layer));
        }
        params.push(string_param(key.group_name()));
        params.push(string_param(name));
        self.send(MessageType::Get, params, Box::new(callback))
    }

    /// Removes a single value.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key is incomplete or the send
    /// fails.
    pub fn unset_value(
        &self,
        key: &Key,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let layer = require_layer(key)?;
        let name = require_name(key)?;
        self.send(
            MessageType::Unset,
            vec![
                string_param(layer),
                string_param(key.group_name()),
                string_param(name),
            ],
            Box::new(callback),
        )
    }

    /// Creates a group.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key has no layer or the send
    /// fails.
    pub fn create_group(
        &self,
        key: &Key,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let layer = require_layer(key)?;
        self.send(
            MessageType::CreateGroup,
            vec![string_param(layer), string_param(key.group_name())],
            Box::new(callback),
        )
    }

    /// Removes a group and everything beneath it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key has no layer or the send
    /// fails.
    pub fn remove_group(
        &self,
        key: &Key,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let layer = require_layer(key)?;
        self.send(
            MessageType::RemoveGroup,
            vec![string_param(layer), string_param(key.group_name())],
            Box::new(callback),
        )
    }

    /// Replaces the label on a group or value.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key has no layer or the send
    /// fails.
    pub fn set_label(
        &self,
        key: &Key,
        label: &Label,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let layer = require_layer(key)?;
        let mut params = vec![string_param(layer), string_param(key.group_name())];
        if let Some(name) = key.name() {
            params.push(string_param(name));
        }
        params.push(string_param(label.as_str()));
        self.send(MessageType::SetLabel, params, Box::new(callback))
    }

    /// Lists the keys of a layer.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the send fails.
    pub fn list_keys(
        &self,
        layer: &str,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        self.send(
            MessageType::List,
            vec![string_param(layer)],
            Box::new(callback),
        )
    }

    /// Registers for change notifications on `(group, name)` in every
    /// layer.
    ///
    /// The callback first receives the acknowledgement, then one call per
    /// delivered change until the registration is retracted.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the send fails.
    pub fn register_notification(
        &self,
        group: &str,
        name: Option<&str>,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let mut params = vec![string_param(group)];
        if let Some(name) = name {
            params.push(string_param(name));
        }
        self.send(MessageType::Notify, params, Box::new(callback))
    }

    /// Retracts a notification registration on `(group, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the send fails.
    pub fn unregister_notification(
        &self,
        group: &str,
        name: Option<&str>,
        callback: impl FnMut(&Response) + Send + 'static,
    ) -> Result<u64, ClientError> {
        let mut params = vec![string_param(group)];
        if let Some(name) = name {
            params.push(string_param(name));
        }
        self.send(MessageType::Unnotify, params, Box::new(callback))
    }

    /// Processes every complete reply currently buffered on the socket.
    /// Does not block; returns the number of frames handled.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on socket failure or a corrupt frame, both
    /// of which end the session.
    pub fn handle_response(&self) -> Result<usize, ClientError> {
        let frames = self.collect_frames()?;
        let mut handled = 0;
        for frame in frames {
            let message = decode(&frame, Direction::Response)?;
            validate_shape(&message)?;
            self.dispatch(message)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Waits up to five seconds for socket readiness, then processes
    /// whatever arrived. Returns the number of frames handled, zero on
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on socket or decode failure.
    pub fn get_response(&self) -> Result<usize, ClientError> {
        let mut pollfds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut pollfds, PollTimeout::from(RESPONSE_POLL_MS))
            .map_err(io::Error::from)?;
        if ready == 0 {
            return Ok(0);
        }
        self.handle_response()
    }

    /// Sets a value and waits for the daemon's status.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn set_value_sync(&self, key: &Key, value: Value) -> Result<Status, ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.set_value(key, value, move |response| {
            capture_status(&capture, response);
        })?;
        self.wait_for(&cell)
    }

    /// Retrieves a value and waits for the status and payload.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn get_value_sync(&self, key: &Key) -> Result<(Status, Option<Value>), ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.get_value(key, move |response| {
            if let Ok(mut slot) = capture.lock() {
                *slot = Some((response.status(), response.value().cloned()));
            }
        })?;
        self.wait_for(&cell)
    }

    /// Retrieves a value together with its stored label.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn get_record_sync(
        &self,
        key: &Key,
    ) -> Result<(Status, Option<(Value, Label)>), ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.get_value(key, move |response| {
            if let Ok(mut slot) = capture.lock() {
                let record = response
                    .params()
                    .get(1)
                    .map(|param| (param.value.clone(), param.label.clone()));
                *slot = Some((response.status(), record));
            }
        })?;
        self.wait_for(&cell)
    }

    /// Removes a value and waits for the daemon's status.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn unset_value_sync(&self, key: &Key) -> Result<Status, ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.unset_value(key, move |response| {
            capture_status(&capture, response);
        })?;
        self.wait_for(&cell)
    }

    /// Creates a group and waits for the daemon's status.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn create_group_sync(&self, key: &Key) -> Result<Status, ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.create_group(key, move |response| {
            capture_status(&capture, response);
        })?;
        self.wait_for(&cell)
    }

    /// Removes a group and waits for the daemon's status.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn remove_group_sync(&self, key: &Key) -> Result<Status, ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.remove_group(key, move |response| {
            capture_status(&capture, response);
        })?;
        self.wait_for(&cell)
    }

    /// Replaces a label and waits for the daemon's status.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn set_label_sync(&self, key: &Key, label: &Label) -> Result<Status, ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.set_label(key, label, move |response| {
            capture_status(&capture, response);
        })?;
        self.wait_for(&cell)
    }

    /// Lists a layer's keys and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no reply arrives in time.
    pub fn list_keys_sync(&self, layer: &str) -> Result<(Status, Vec<String>), ClientError> {
        let cell = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&cell);
        self.list_keys(layer, move |response| {
            if let Ok(mut slot) = capture.lock() {
                let keys = response.keys().iter().map(|key| (*key).to_string()).collect();
                *slot = Some((response.status(), keys));
            }
        })?;
        self.wait_for(&cell)
    }

    fn next_msgid(&self) -> u64 {
        self.msgid.fetch_add(1, Ordering::Relaxed)
    }

    fn send(
        &self,
        msg_type: MessageType,
        params: Vec<Param>,
        callback: Callback,
    ) -> Result<u64, ClientError> {
        let msgid = self.next_msgid();
        let frame = encode(&Message::new(msg_type, msgid, params))?;

        {
            let mut tables = self.tables.lock().map_err(ClientError::lock)?;
            sweep_expired(&mut tables.one_shot);
            tables.one_shot.insert(
                msgid,
                Pending {
                    callback,
                    msg_type,
                    created: Instant::now(),
                },
            );
        }

        if let Err(error) = self.write_frame(&frame) {
            if let Ok(mut tables) = self.tables.lock() {
                tables.one_shot.remove(&msgid);
            }
            return Err(error);
        }
        debug!(target: CLIENT_TARGET, msgid, kind = %msg_type, "request sent");
        Ok(msgid)
    }

    /// Writes one frame to the non-blocking socket, polling for write
    /// readiness as needed.
    fn write_frame(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut written = 0;
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        while written < frame.len() {
            match (&self.stream).write(&frame[written..]) {
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::Timeout);
                    }
                    let mut pollfds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLOUT)];
                    poll(&mut pollfds, PollTimeout::from(100_u16)).map_err(io::Error::from)?;
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Reads everything available and splits the buffer into complete
    /// frames.
    fn collect_frames(&self) -> Result<Vec<Vec<u8>>, ClientError> {
        let mut buffer = self.read_buffer.lock().map_err(ClientError::lock)?;

        let mut chunk = [0_u8; 4096];
        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => buffer.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }

        let mut frames = Vec::new();
        loop {
            match peek_size(&buffer)? {
                Some(total) if buffer.len() >= total => {
                    frames.push(buffer.drain(..total).collect());
                }
                _ => break,
            }
        }
        Ok(frames)
    }

    fn dispatch(&self, message: Message) -> Result<(), ClientError> {
        let response = Response::new(message.msg_type, message.msgid, message.params);
        let msgid = response.msgid();

        let pending = {
            let mut tables = self.tables.lock().map_err(ClientError::lock)?;
            tables.one_shot.remove(&msgid)
        };

        if let Some(mut pending) = pending {
            let acknowledged = response.status();
            (pending.callback)(&response);
            match pending.msg_type {
                MessageType::Notify if acknowledged.is_ok() => {
                    // The registration is live; keep the callback for
                    // every matching CHANGED frame.
                    let mut tables = self.tables.lock().map_err(ClientError::lock)?;
                    tables.subscriptions.insert(msgid, pending.callback);
                }
                MessageType::Unnotify if acknowledged.is_ok() => {
                    if let Some(removed) = response.removed_msgid() {
                        let mut tables = self.tables.lock().map_err(ClientError::lock)?;
                        tables.subscriptions.remove(&removed);
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        if response.msg_type() == MessageType::Changed {
            // Temporarily detach the callback so it may issue requests
            // without deadlocking on the table mutex.
            let callback = {
                let mut tables = self.tables.lock().map_err(ClientError::lock)?;
                tables.subscriptions.remove(&msgid)
            };
            if let Some(mut callback) = callback {
                callback(&response);
                let mut tables = self.tables.lock().map_err(ClientError::lock)?;
                tables.subscriptions.entry(msgid).or_insert(callback);
                return Ok(());
            }
        }

        debug!(target: CLIENT_TARGET, msgid, "reply matched no outstanding request");
        Ok(())
    }

    fn wait_for<T>(&self, cell: &Arc<Mutex<Option<T>>>) -> Result<T, ClientError> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            if let Some(result) = cell.lock().map_err(ClientError::lock)?.take() {
                return Ok(result);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            self.get_response()?;
        }
    }
}

fn sweep_expired(one_shot: &mut HashMap<u64, Pending>) {
    one_shot.retain(|msgid, pending| {
        let keep = pending.created.elapsed() <= CALLBACK_TIMEOUT;
        if !keep {
            debug!(target: CLIENT_TARGET, msgid, "dropping timed-out request");
        }
        keep
    });
}

fn validate_shape(message: &Message) -> Result<(), ClientError> {
    let valid = match message.msg_type {
        MessageType::Status => matches!(
            message.params.first().map(|param| &param.value),
            Some(Value::Int32(_))
        ),
        MessageType::Changed => matches!(
            message.params.first().map(|param| &param.value),
            Some(Value::String(_))
        ),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ClientError::InvalidResponse(format!(
            "{} frame with a malformed leading parameter",
            message.msg_type
        )))
    }
}

fn string_param(text: &str) -> Param {
    Param::plain(Value::String(text.to_string()))
}

fn require_layer(key: &Key) -> Result<&str, ClientError> {
    key.layer().ok_or(ClientError::IncompleteKey("layer"))
}

fn require_name(key: &Key) -> Result<&str, ClientError> {
    key.name().ok_or(ClientError::IncompleteKey("name"))
}

fn capture_status(cell: &Arc<Mutex<Option<Status>>>, response: &Response) {
    if let Ok(mut slot) = cell.lock() {
        *slot = Some(response.status());
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::thread;

    use super::*;

    /// A scripted daemon stand-in: accepts one connection, then replies
    /// to each received frame from the provided script.
    fn fake_daemon(
        replies: Vec<Vec<Message>>,
    ) -> (Utf8PathBuf, tempfile::TempDir, thread::JoinHandle<()>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("socket")).expect("utf8");
        let listener = UnixListener::bind(&path).expect("bind");

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            for batch in replies {
                // Consume one request frame.
                let mut header = [0_u8; 8];
                stream.read_exact(&mut header).expect("read header");
                let total = peek_size(&header).expect("peek").expect("size");
                let mut rest = vec![0_u8; total - header.len()];
                stream.read_exact(&mut rest).expect("read body");

                for reply in batch {
                    let frame = encode(&reply).expect("encode reply");
                    stream.write_all(&frame).expect("write reply");
                }
            }
        });

        (path, dir, handle)
    }

    fn status_message(msgid: u64, status: Status) -> Message {
        Message::new(
            MessageType::Status,
            msgid,
            vec![Param::plain(Value::Int32(status.code()))],
        )
    }

    #[test]
    fn acknowledgements_reach_their_callback() {
        let (path, _dir, handle) = fake_daemon(vec![vec![status_message(1, Status::Ok)]]);
        let client = Client::connect_to(&path).expect("connect");

        let key = Key::new(Some("base"), "net", Some("mtu")).expect("key");
        let status = client.set_value_sync(&key, Value::Int32(1500)).expect("set");
        assert_eq!(status, Status::Ok);
        handle.join().expect("daemon thread");
    }

    #[test]
    fn get_sync_returns_the_payload() {
        let reply = Message::new(
            MessageType::Status,
            1,
            vec![
                Param::plain(Value::Int32(Status::Ok.code())),
                Param::plain(Value::Int32(1500)),
            ],
        );
        let (path, _dir, handle) = fake_daemon(vec![vec![reply]]);
        let client = Client::connect_to(&path).expect("connect");

        let key = Key::new(None::<&str>, "net", Some("mtu")).expect("key");
        let (status, value) = client.get_value_sync(&key).expect("get");
        assert_eq!(status, Status::Ok);
        assert_eq!(value, Some(Value::Int32(1500)));
        handle.join().expect("daemon thread");
    }

    #[test]
    fn notify_migrates_and_changed_frames_reuse_the_msgid() {
        let changed = Message::new(
            MessageType::Changed,
            1,
            vec![
                Param::plain(Value::String("mtu".into())),
                Param::plain(Value::Int32(9000)),
            ],
        );
        let (path, _dir, handle) = fake_daemon(vec![
            vec![status_message(1, Status::Ok), changed],
            vec![status_message(2, Status::Ok)],
        ]);
        let client = Client::connect_to(&path).expect("connect");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client
            .register_notification("net", Some("mtu"), move |response| {
                sink.lock()
                    .expect("sink lock")
                    .push((response.msg_type(), response.msgid(), response.value().cloned()));
            })
            .expect("register");

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        while seen.lock().expect("seen lock").len() < 2 && Instant::now() < deadline {
            client.get_response().expect("drain");
        }

        // A later request keeps its own correlation; the notification
        // callback must not swallow it.
        let key = Key::new(Some("base"), "net", Some("mtu")).expect("key");
        let status = client.set_value_sync(&key, Value::Int32(1)).expect("set");
        assert_eq!(status, Status::Ok);

        let seen = seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, MessageType::Status);
        assert_eq!(seen[1], (MessageType::Changed, 1, Some(Value::Int32(9000))));
        handle.join().expect("daemon thread");
    }

    #[test]
    fn unnotify_retracts_the_subscription() {
        let unnotify_ack = Message::new(
            MessageType::Status,
            2,
            vec![
                Param::plain(Value::Int32(Status::Ok.code())),
                Param::plain(Value::String("net:mtu".into())),
                Param::plain(Value::Uint64(1)),
            ],
        );
        let late_change = Message::new(
            MessageType::Changed,
            1,
            vec![Param::plain(Value::String("mtu".into()))],
        );
        let (path, _dir, handle) = fake_daemon(vec![
            vec![status_message(1, Status::Ok)],
            vec![unnotify_ack, late_change],
        ]);
        let client = Client::connect_to(&path).expect("connect");

        let changes = Arc::new(Mutex::new(0_usize));
        let counter = Arc::clone(&changes);
        client
            .register_notification("net", Some("mtu"), move |response| {
                if response.msg_type() == MessageType::Changed {
                    *counter.lock().expect("counter lock") += 1;
                }
            })
            .expect("register");
        client.get_response().expect("ack");

        let done = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&done);
        client
            .unregister_notification("net", Some("mtu"), move |response| {
                capture_status(&capture, response);
            })
            .expect("unregister");
        let status = client.wait_for(&done).expect("unnotify ack");
        assert_eq!(status, Status::Ok);

        // The straggling CHANGED frame has no registration left to hit.
        let _ = client.handle_response().expect("drain");
        assert_eq!(*changes.lock().expect("counter lock"), 0);
        handle.join().expect("daemon thread");
    }

    #[test]
    fn stale_requests_are_swept_on_send() {
        let (path, _dir, handle) =
            fake_daemon(vec![vec![], vec![status_message(2, Status::Ok)]]);
        let client = Client::connect_to(&path).expect("connect");

        let key = Key::new(Some("base"), "net", Some("mtu")).expect("key");
        client
            .set_value(&key, Value::Int32(1), |_| {})
            .expect("first send");
        {
            let mut tables = client.tables.lock().expect("tables lock");
            let pending = tables.one_shot.get_mut(&1).expect("pending entry");
            pending.created = Instant::now() - CALLBACK_TIMEOUT - Duration::from_secs(1);
        }

        client
            .set_value(&key, Value::Int32(2), |_| {})
            .expect("second send");
        let tables = client.tables.lock().expect("tables lock");
        assert!(!tables.one_shot.contains_key(&1));
        assert!(tables.one_shot.contains_key(&2));
        drop(tables);
        handle.join().expect("daemon thread");
    }

    #[test]
    fn incomplete_keys_are_rejected_before_sending() {
        let (path, _dir, handle) = fake_daemon(vec![]);
        let client = Client::connect_to(&path).expect("connect");

        let group_only = Key::new(None::<&str>, "net", None::<&str>).expect("key");
        assert!(matches!(
            client.get_value(&group_only, |_| {}),
            Err(ClientError::IncompleteKey("name"))
        ));
        let no_layer = Key::new(None::<&str>, "net", Some("mtu")).expect("key");
        assert!(matches!(
            client.set_value(&no_layer, Value::Int32(1), |_| {}),
            Err(ClientError::IncompleteKey("layer"))
        ));
        drop(client);
        handle.join().expect("daemon thread");
    }
}
