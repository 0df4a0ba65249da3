//! Listening-socket acquisition for the daemon.
//!
//! Two paths produce the daemon's listeners. Under a supervisor the
//! listening sockets arrive as inherited descriptors announced through
//! `LISTEN_FDS`/`LISTEN_PID`, starting at descriptor 3. Started manually,
//! the daemon binds the well-known path itself: a stale socket entry is
//! probed and unlinked, the fresh socket is bound, and its permissions are
//! opened to 0666 so any local peer may connect. Only the manual path owns
//! the filesystem entry, so only that path unlinks it on teardown.

use std::fs;
use std::io;
use std::os::fd::{AsFd, FromRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};

use camino::{Utf8Path, Utf8PathBuf};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::listener");

const LISTEN_FDS_START: RawFd = 3;

/// Errors raised while acquiring listening sockets.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The supervisor's descriptor announcement did not parse.
    #[error("malformed listener inheritance environment: {0}")]
    MalformedInheritance(String),
    /// An inherited descriptor could not be configured.
    #[error("failed to configure inherited fd {fd}: {source}")]
    InheritedFd {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    /// The socket path is occupied by something that is not a socket.
    #[error("'{path}' exists and is not a socket")]
    NotASocket { path: Utf8PathBuf },
    /// Another daemon is already serving the socket path.
    #[error("'{path}' is already in use")]
    InUse { path: Utf8PathBuf },
    /// Filesystem or bind errors on the socket path.
    #[error("failed to bind '{path}': {source}")]
    Bind {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A listening socket, with the filesystem entry to unlink when this
/// daemon created it.
#[derive(Debug)]
pub struct DaemonListener {
    listener: UnixListener,
    owned_path: Option<Utf8PathBuf>,
}

impl DaemonListener {
    /// Accepts one pending connection, or `None` when none is queued.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }
}

impl AsFd for DaemonListener {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl Drop for DaemonListener {
    fn drop(&mut self) {
        if let Some(path) = &self.owned_path
            && let Err(error) = fs::remove_file(path)
            && error.kind() != io::ErrorKind::NotFound
        {
            warn!(
                target: LISTENER_TARGET,
                %error,
                %path,
                "failed to remove socket file"
            );
        }
    }
}

/// Acquires the daemon's listeners: inherited descriptors when a
/// supervisor provides them, a manual bind at `socket_path` otherwise.
///
/// # Errors
///
/// Returns [`ListenerError`] when inherited descriptors are unusable or
/// the manual bind fails.
pub fn acquire_listeners(socket_path: &Utf8Path) -> Result<Vec<DaemonListener>, ListenerError> {
    if let Some(fds) = inherited_fds()? {
        info!(
            target: LISTENER_TARGET,
            count = fds.len(),
            "using supervisor-provided listeners"
        );
        return fds.into_iter().map(adopt_inherited).collect();
    }

    let listener = bind_manual(socket_path)?;
    info!(target: LISTENER_TARGET, path = %socket_path, "listening");
    Ok(vec![listener])
}

/// Reads the supervisor's descriptor announcement.
///
/// Returns `None` when no announcement is present or it addresses another
/// process.
fn inherited_fds() -> Result<Option<Vec<RawFd>>, ListenerError> {
    let Ok(listen_pid) = std::env::var("LISTEN_PID") else {
        return Ok(None);
    };
    let Ok(listen_fds) = std::env::var("LISTEN_FDS") else {
        return Ok(None);
    };

    let pid: i32 = listen_pid
        .parse()
        .map_err(|_| ListenerError::MalformedInheritance(listen_pid.clone()))?;
    if Pid::from_raw(pid) != nix::unistd::getpid() {
        debug!(target: LISTENER_TARGET, pid, "listener inheritance addresses another process");
        return Ok(None);
    }

    let count: RawFd = listen_fds
        .parse()
        .map_err(|_| ListenerError::MalformedInheritance(listen_fds.clone()))?;
    if count <= 0 {
        return Ok(None);
    }

    Ok(Some(
        (LISTEN_FDS_START..LISTEN_FDS_START + count).collect(),
    ))
}

fn adopt_inherited(fd: RawFd) -> Result<DaemonListener, ListenerError> {
    // Inherited descriptors arrive without close-on-exec.
    // SAFETY: fd is a descriptor this process owns for its lifetime.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc != 0 {
        return Err(ListenerError::InheritedFd {
            fd,
            source: io::Error::last_os_error(),
        });
    }

    // SAFETY: the supervisor hands each announced descriptor to this
    // process exactly once, so ownership transfer is sound.
    let listener = unsafe { UnixListener::from_raw_fd(fd) };
    listener
        .set_nonblocking(true)
        .map_err(|source| ListenerError::InheritedFd { fd, source })?;
    Ok(DaemonListener {
        listener,
        owned_path: None,
    })
}

fn bind_manual(path: &Utf8Path) -> Result<DaemonListener, ListenerError> {
    if path.as_std_path().exists() {
        remove_stale_socket(path)?;
    }

    let listener = UnixListener::bind(path).map_err(|source| ListenerError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    // Any local peer may connect; authorisation happens per record.
    fs::set_permissions(path, fs::Permissions::from_mode(0o666)).map_err(|source| {
        ListenerError::Bind {
            path: path.to_path_buf(),
            source,
        }
    })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| ListenerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(DaemonListener {
        listener,
        owned_path: Some(path.to_path_buf()),
    })
}

fn remove_stale_socket(path: &Utf8Path) -> Result<(), ListenerError> {
    let metadata = fs::symlink_metadata(path).map_err(|source| ListenerError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.file_type().is_socket() {
        return Err(ListenerError::NotASocket {
            path: path.to_path_buf(),
        });
    }

    match UnixStream::connect(path) {
        Ok(_stream) => Err(ListenerError::InUse {
            path: path.to_path_buf(),
        }),
        Err(error)
            if error.kind() == io::ErrorKind::ConnectionRefused
                || error.kind() == io::ErrorKind::NotFound =>
        {
            debug!(target: LISTENER_TARGET, %path, "removing stale socket entry");
            fs::remove_file(path).map_err(|source| ListenerError::Bind {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(ListenerError::Bind {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(name)).expect("utf8 path")
    }

    #[test]
    fn manual_bind_creates_a_world_writable_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = scratch_path(&dir, "buxton-test");
        let listeners = acquire_listeners(&path).expect("bind");
        assert_eq!(listeners.len(), 1);

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn stale_socket_entries_are_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = scratch_path(&dir, "buxton-test");
        // A bare std listener leaves its socket file behind on drop.
        drop(UnixListener::bind(&path).expect("first bind"));
        assert!(path.as_std_path().exists());

        let listeners = acquire_listeners(&path).expect("rebind over stale entry");
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn non_socket_entries_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = scratch_path(&dir, "buxton-test");
        fs::write(&path, b"not a socket").expect("write file");
        assert!(matches!(
            acquire_listeners(&path),
            Err(ListenerError::NotASocket { .. })
        ));
    }

    #[test]
    fn live_sockets_are_not_stolen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = scratch_path(&dir, "buxton-test");
        let _active = acquire_listeners(&path).expect("first bind");
        assert!(matches!(
            acquire_listeners(&path),
            Err(ListenerError::InUse { .. })
        ));
    }

    #[test]
    fn dropping_a_bound_listener_unlinks_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = scratch_path(&dir, "buxton-test");
        drop(acquire_listeners(&path).expect("bind"));
        assert!(!path.as_std_path().exists());
    }
}
