//! Connected-client state.
//!
//! Each accepted socket becomes a [`Client`]: peer credentials captured
//! once at accept time, the peer's Smack label re-read on every inbound
//! message, a read buffer that accumulates frames, and a FIFO queue of
//! encoded frames awaiting write readiness. The [`ClientTable`] gives the
//! event loop O(1) lookup by descriptor.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{getsockopt, sockopt};
use tracing::debug;

use buxton_proto::Label;

const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::clients");

/// Peer credentials captured when the connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Effective uid of the peer.
    pub uid: u32,
    /// Process id of the peer.
    pub pid: i32,
}

/// One connected peer.
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
    credentials: Credentials,
    label: Option<Label>,
    read_buffer: Vec<u8>,
    write_queue: VecDeque<Vec<u8>>,
    write_offset: usize,
    subscriptions: Vec<(String, Option<String>)>,
}

impl Client {
    /// Wraps an accepted stream, capturing the peer's credentials.
    ///
    /// # Errors
    ///
    /// Returns an error when the credentials cannot be read, in which case
    /// the connection is refused.
    pub fn accept(stream: UnixStream) -> io::Result<Self> {
        let credentials = peer_credentials(&stream)?;
        let label = peer_label(&stream);
        Ok(Self {
            stream,
            credentials,
            label,
            read_buffer: Vec::new(),
            write_queue: VecDeque::new(),
            write_offset: 0,
            subscriptions: Vec::new(),
        })
    }

    /// Returns the client's descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Returns the underlying stream.
    #[must_use]
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Returns the credentials captured at accept time.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Returns the most recently read peer label.
    #[must_use]
    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    /// Re-reads the peer's label from the socket. The kernel may relabel a
    /// running peer, so this happens before every dispatched message.
    pub fn refresh_label(&mut self) {
        self.label = peer_label(&self.stream);
    }

    /// Appends raw bytes read from the socket to the frame buffer.
    pub fn buffer_input(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Returns the current frame buffer.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.read_buffer
    }

    /// Removes and returns the first `len` buffered bytes.
    pub fn take_frame(&mut self, len: usize) -> Vec<u8> {
        let frame: Vec<u8> = self.read_buffer.drain(..len).collect();
        frame
    }

    /// Queues an encoded frame for delivery.
    pub fn enqueue(&mut self, frame: Vec<u8>) {
        self.write_queue.push_back(frame);
    }

    /// Returns `true` when frames are waiting to be written.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Writes queued frames until the queue empties or the socket stops
    /// accepting bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error; the caller evicts the client.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(frame) = self.write_queue.front() {
            match self.stream.write(&frame[self.write_offset..]) {
                Ok(written) => {
                    self.write_offset += written;
                    if self.write_offset >= frame.len() {
                        self.write_queue.pop_front();
                        self.write_offset = 0;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Reads every byte currently available on the socket into the frame
    /// buffer. Returns `true` while the connection is open.
    ///
    /// # Errors
    ///
    /// Returns the underlying read error; the caller evicts the client.
    pub fn drain_socket(&mut self) -> io::Result<bool> {
        let mut chunk = [0_u8; 4096];
        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(read) => self.buffer_input(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
    }

    /// Records a subscription for retraction at disconnect.
    pub fn track_subscription(&mut self, group: String, name: Option<String>) {
        self.subscriptions.push((group, name));
    }

    /// Forgets a retracted subscription.
    pub fn untrack_subscription(&mut self, group: &str, name: Option<&str>) {
        self.subscriptions
            .retain(|(g, n)| !(g == group && n.as_deref() == name));
    }

    /// Returns the subscriptions held by this client.
    #[must_use]
    pub fn subscriptions(&self) -> &[(String, Option<String>)] {
        &self.subscriptions
    }
}

/// Active clients, keyed by descriptor for O(1) event-loop lookup.
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: HashMap<RawFd, Client>,
}

impl ClientTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an accepted client and returns its descriptor.
    pub fn insert(&mut self, client: Client) -> RawFd {
        let fd = client.fd();
        debug!(
            target: CLIENT_TARGET,
            fd,
            uid = client.credentials.uid,
            pid = client.credentials.pid,
            "client connected"
        );
        self.clients.insert(fd, client);
        fd
    }

    /// Looks up a client by descriptor.
    #[must_use]
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Client> {
        self.clients.get_mut(&fd)
    }

    /// Removes a client; the socket closes when the entry drops.
    pub fn remove(&mut self, fd: RawFd) -> Option<Client> {
        let client = self.clients.remove(&fd);
        if client.is_some() {
            debug!(target: CLIENT_TARGET, fd, "client removed");
        }
        client
    }

    /// Iterates over all connected clients.
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Returns the number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` when no clients are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drains every client, closing their sockets.
    pub fn clear(&mut self) {
        self.clients.clear();
    }

    /// Returns the descriptors of every connected client.
    #[must_use]
    pub fn fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }
}

fn peer_credentials(stream: &UnixStream) -> io::Result<Credentials> {
    let creds = getsockopt(stream, sockopt::PeerCredentials)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    Ok(Credentials {
        uid: creds.uid(),
        pid: creds.pid(),
    })
}

/// Reads the peer's Smack label from the socket, if the kernel provides
/// one. Absent label support, clients are unlabelled and label checks are
/// skipped for them.
fn peer_label(stream: &UnixStream) -> Option<Label> {
    let mut buffer = [0_u8; 256];
    let mut len = buffer.len() as libc::socklen_t;
    // SAFETY: the buffer outlives the call and len describes its capacity.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERSEC,
            buffer.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    let raw = &buffer[..len as usize];
    let text = raw.split(|byte| *byte == 0).next()?;
    let text = std::str::from_utf8(text).ok()?;
    Label::new(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Client, UnixStream) {
        let (server, client) = UnixStream::pair().expect("socketpair");
        server.set_nonblocking(true).expect("nonblocking");
        (Client::accept(server).expect("accept"), client)
    }

    #[test]
    fn credentials_reflect_this_process() {
        let (client, _peer) = pair();
        assert_eq!(client.credentials().uid, nix::unistd::geteuid().as_raw());
        assert_eq!(client.credentials().pid, nix::unistd::getpid().as_raw());
    }

    #[test]
    fn drain_socket_buffers_available_bytes() {
        let (mut client, mut peer) = pair();
        peer.write_all(b"hello").expect("write");
        assert!(client.drain_socket().expect("drain"));
        assert_eq!(client.buffered(), b"hello");
    }

    #[test]
    fn drain_socket_reports_eof() {
        let (mut client, peer) = pair();
        drop(peer);
        assert!(!client.drain_socket().expect("drain"));
    }

    #[test]
    fn flush_delivers_queued_frames_in_order() {
        let (mut client, mut peer) = pair();
        client.enqueue(vec![1, 2]);
        client.enqueue(vec![3]);
        client.flush().expect("flush");
        assert!(!client.has_pending_writes());

        let mut received = [0_u8; 3];
        peer.read_exact(&mut received).expect("read");
        assert_eq!(received, [1, 2, 3]);
    }

    #[test]
    fn take_frame_consumes_the_buffer_front() {
        let (mut client, _peer) = pair();
        client.buffer_input(&[1, 2, 3, 4]);
        assert_eq!(client.take_frame(3), vec![1, 2, 3]);
        assert_eq!(client.buffered(), &[4]);
    }

    #[test]
    fn table_lookup_is_by_descriptor() {
        let (client, _peer) = pair();
        let mut table = ClientTable::new();
        let fd = table.insert(client);
        assert!(table.get_mut(fd).is_some());
        assert!(table.remove(fd).is_some());
        assert!(table.remove(fd).is_none());
    }

    #[test]
    fn subscription_tracking_round_trips() {
        let (mut client, _peer) = pair();
        client.track_subscription("net".into(), Some("mtu".into()));
        client.track_subscription("net".into(), None);
        client.untrack_subscription("net", Some("mtu"));
        assert_eq!(client.subscriptions(), &[("net".to_string(), None)]);
    }
}
