//! Direct, in-process access to the layered configuration database.
//!
//! This crate binds the three ingredients of the database together: the
//! storage backends behind each layer, the Smack-style access-control
//! primitive, and the resolver that executes operations against them. The
//! daemon embeds a [`Control`] and drives it on behalf of socket clients;
//! privileged tools construct one themselves and bypass the socket
//! entirely, which is the direct path.
//!
//! Backends are capability records behind the [`StorageBackend`] trait and
//! load lazily through the [`BackendRegistry`]; a layer never sees more
//! than one instance per backend kind.

mod backend;
mod error;
mod memory;
mod persistent;
mod resolver;
mod smack;

pub use backend::{
    BackendError, BackendRegistry, DbId, StorageBackend, StoredKey, StoredRecord,
};
pub use error::DirectError;
pub use memory::MemoryBackend;
pub use persistent::PersistentBackend;
pub use resolver::{Caller, Control, Fanout, GROUP_VALUE};
pub use smack::{AccessMode, SmackCache, SmackError};
