//! Client library for the Buxton configuration daemon.
//!
//! A [`Client`] holds one connection to the daemon socket. Requests are
//! asynchronous: each send registers a callback under a fresh correlation
//! id and returns immediately; [`Client::handle_response`] drains the
//! socket and dispatches whatever replies have arrived. Synchronous
//! wrappers (`*_sync`) are provided for callers that simply want to wait.
//!
//! Application threads may send while another thread drains the socket,
//! so the correlation tables sit behind a single mutex. Notification
//! callbacks outlive their originating request: once the daemon
//! acknowledges a `NOTIFY`, the callback migrates to a persistent table
//! and fires again for every matching `CHANGED` frame until an
//! `UNNOTIFY` retracts it.

mod client;
mod response;

pub use client::{Client, ClientError};
pub use response::Response;

pub use buxton_proto::{DataType, Key, KeyError, Label, MessageType, Param, Status, Value};
