//! The Buxton configuration daemon.
//!
//! The daemon serves the layered configuration database over a Unix
//! stream socket. One single-threaded readiness loop owns everything:
//! listener sockets, connected clients, the resolver with its backends,
//! the access-control rule cache and watch, and the change-notification
//! registry. The crate exposes the [`Daemon`] type so tests can build an
//! instance against scratch paths and drive the loop directly.

mod clients;
mod daemon;
mod listener;
mod notify;

pub use clients::{Client, ClientTable, Credentials};
pub use daemon::{Daemon, DaemonError, Options};
pub use listener::{DaemonListener, ListenerError, acquire_listeners};
pub use notify::{Notifier, Subscription};
