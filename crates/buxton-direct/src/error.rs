//! Error type for direct (in-process) operations.

use thiserror::Error;

use buxton_proto::Status;

use crate::backend::BackendError;

/// Errors surfaced by the resolver and the direct path.
///
/// Every variant maps onto one wire status via [`DirectError::status`], so
/// the daemon can terminate any failure at the resolver boundary with a
/// status frame.
#[derive(Debug, Error)]
pub enum DirectError {
    /// The named layer is not configured.
    #[error("unknown layer '{0}'")]
    UnknownLayer(String),
    /// The operation needs a layer but the key did not carry one.
    #[error("a layer is required for this operation")]
    LayerRequired,
    /// The operation addressed a group or value the key shape cannot.
    #[error("malformed key for this operation: '{0}'")]
    BadKey(String),
    /// The group sentinel for the key does not exist.
    #[error("group '{0}' does not exist")]
    GroupNotFound(String),
    /// The addressed value does not exist.
    #[error("'{0}' not found")]
    NotFound(String),
    /// The group sentinel already exists.
    #[error("group '{0}' already exists")]
    AlreadyExists(String),
    /// Label rules or the root requirement deny the operation.
    #[error("permission denied for '{0}'")]
    PermissionDenied(String),
    /// The storage module failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl DirectError {
    /// Maps the error onto its wire status.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownLayer(_) | Self::GroupNotFound(_) | Self::NotFound(_) => Status::NotFound,
            Self::LayerRequired | Self::BadKey(_) => Status::BadArgs,
            Self::AlreadyExists(_) => Status::AlreadyExists,
            Self::PermissionDenied(_) => Status::PermissionDenied,
            Self::Backend(_) => Status::Failed,
        }
    }
}
