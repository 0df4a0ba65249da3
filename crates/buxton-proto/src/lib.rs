//! Data model and wire codec for the Buxton configuration daemon.
//!
//! Buxton clients and the daemon exchange length-prefixed binary frames over
//! a Unix stream socket. Each frame carries a message type, a correlation id
//! and up to sixteen typed parameters; every parameter pairs a value with the
//! access-control label attached to it. This crate defines the value model
//! ([`Value`], [`Label`], [`Key`]), the message and status taxonomy, and the
//! codec ([`peek_size`], [`encode`], [`decode`]).
//!
//! ## Frame layout
//!
//! All integers are little-endian. A frame is:
//!
//! ```text
//! magic:u32 = 0x672 | total_len:u32 | msg_type:u32 | msgid:u64 | param_count:u32 | params...
//! ```
//!
//! `total_len` includes the 24-byte header and is capped at 4096 bytes; a
//! frame may carry at most 16 parameters. Each parameter is:
//!
//! ```text
//! type:u32 | label_len:u32 | value_len:u32 | label_bytes | value_bytes
//! ```
//!
//! String payloads (values and labels alike) carry a single trailing NUL
//! byte and their length fields count it, so an empty string serialises to
//! length 1 and a label is never shorter than 2 bytes on the wire.

mod key;
mod message;
mod value;
mod wire;

pub use key::{Key, KeyError};
pub use message::{Direction, MessageType, Status};
pub use value::{DataType, Label, Value};
pub use wire::{
    HEADER_LEN, MAGIC, MAX_MESSAGE_LEN, MAX_PARAMS, MIN_PARAM_LEN, Message, Param, WireError,
    decode, encode, peek_size,
};
