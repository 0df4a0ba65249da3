//! Message and status taxonomy for the wire protocol.

use std::fmt;

/// Direction a frame travels in, used to validate message types on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to daemon.
    Request,
    /// Daemon to client.
    Response,
}

/// Control message types carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Set a value.
    Set = 1,
    /// Replace the label on an existing group or value.
    SetLabel = 2,
    /// Create a group sentinel.
    CreateGroup = 3,
    /// Remove a group and every key beneath it.
    RemoveGroup = 4,
    /// Retrieve a value, cross-layer when no layer is named.
    Get = 5,
    /// Remove a single value.
    Unset = 6,
    /// Enumerate the keys of a layer.
    List = 7,
    /// Status reply, first parameter is the `Int32` status code.
    Status = 8,
    /// Register for change notifications on a key.
    Notify = 9,
    /// Retract a notification registration.
    Unnotify = 10,
    /// A watched key changed; correlation id is the original notify msgid.
    Changed = 11,
}

impl MessageType {
    /// Maps a wire identifier back to a message type.
    #[must_use]
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Set),
            2 => Some(Self::SetLabel),
            3 => Some(Self::CreateGroup),
            4 => Some(Self::RemoveGroup),
            5 => Some(Self::Get),
            6 => Some(Self::Unset),
            7 => Some(Self::List),
            8 => Some(Self::Status),
            9 => Some(Self::Notify),
            10 => Some(Self::Unnotify),
            11 => Some(Self::Changed),
            _ => None,
        }
    }

    /// Returns the wire identifier for this message type.
    #[must_use]
    pub fn wire_id(self) -> u32 {
        self as u32
    }

    /// Returns `true` when the type is legal for the given direction.
    #[must_use]
    pub fn permitted(self, direction: Direction) -> bool {
        match direction {
            Direction::Request => !matches!(self, Self::Status | Self::Changed),
            Direction::Response => matches!(self, Self::Status | Self::Changed),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Set => "set",
            Self::SetLabel => "set-label",
            Self::CreateGroup => "create-group",
            Self::RemoveGroup => "remove-group",
            Self::Get => "get",
            Self::Unset => "unset",
            Self::List => "list",
            Self::Status => "status",
            Self::Notify => "notify",
            Self::Unnotify => "unnotify",
            Self::Changed => "changed",
        };
        formatter.write_str(label)
    }
}

/// Operation status carried as the leading `Int32` of a status frame.
///
/// Non-negative codes are daemon statuses; negative codes are negated POSIX
/// errnos, keeping the two namespaces disjoint on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed,
    BadArgs,
    ServerDown,
    SocketWrite,
    SocketRead,
    Oom,
    MutexLock,
    Callback,
    MessageCorrupt,
    ExceededMaxParams,
    InvalidType,
    InvalidControlField,
    /// The caller's label or uid does not permit the operation.
    PermissionDenied,
    /// The layer, group or value does not exist.
    NotFound,
    /// The group already exists.
    AlreadyExists,
}

impl Status {
    /// Returns the wire code for this status.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Failed => 1,
            Self::BadArgs => 2,
            Self::ServerDown => 3,
            Self::SocketWrite => 4,
            Self::SocketRead => 5,
            Self::Oom => 6,
            Self::MutexLock => 7,
            Self::Callback => 8,
            Self::MessageCorrupt => 9,
            Self::ExceededMaxParams => 10,
            Self::InvalidType => 11,
            Self::InvalidControlField => 12,
            Self::PermissionDenied => -libc::EPERM,
            Self::NotFound => -libc::ENOENT,
            Self::AlreadyExists => -libc::EEXIST,
        }
    }

    /// Maps a wire code back to a status.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Failed),
            2 => Some(Self::BadArgs),
            3 => Some(Self::ServerDown),
            4 => Some(Self::SocketWrite),
            5 => Some(Self::SocketRead),
            6 => Some(Self::Oom),
            7 => Some(Self::MutexLock),
            8 => Some(Self::Callback),
            9 => Some(Self::MessageCorrupt),
            10 => Some(Self::ExceededMaxParams),
            11 => Some(Self::InvalidType),
            12 => Some(Self::InvalidControlField),
            code if code == -libc::EPERM => Some(Self::PermissionDenied),
            code if code == -libc::ENOENT => Some(Self::NotFound),
            code if code == -libc::EEXIST => Some(Self::AlreadyExists),
            _ => None,
        }
    }

    /// Returns `true` for the success status.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "ok",
            Self::Failed => "operation failed",
            Self::BadArgs => "bad arguments",
            Self::ServerDown => "server down",
            Self::SocketWrite => "socket write failed",
            Self::SocketRead => "socket read failed",
            Self::Oom => "out of memory",
            Self::MutexLock => "lock failed",
            Self::Callback => "callback registration failed",
            Self::MessageCorrupt => "corrupt message",
            Self::ExceededMaxParams => "too many parameters",
            Self::InvalidType => "invalid value type",
            Self::InvalidControlField => "invalid control field",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
        };
        formatter.write_str(label)
    }
}
