//! Storage capability surface and the backend registry.
//!
//! A backend exposes exactly four operations over a layer database: get,
//! set, unset and list. The registry maps each [`BackendKind`] to at most
//! one live backend instance, opened lazily the first time any layer
//! references it. A failed open fails only the request that triggered it;
//! later requests retry. Teardown drops every loaded backend exactly once
//! and is a no-op when repeated.

use std::collections::HashMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

use buxton_config::BackendKind;
use buxton_proto::{Label, Value};

use crate::memory::MemoryBackend;
use crate::persistent::PersistentBackend;

const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");

/// Identity of one layer database: the layer name plus, for user layers,
/// the owning uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbId {
    /// Layer name.
    pub layer: String,
    /// Owning uid; `None` for system layers.
    pub uid: Option<u32>,
}

impl DbId {
    /// Builds a database identity.
    #[must_use]
    pub fn new(layer: impl Into<String>, uid: Option<u32>) -> Self {
        Self {
            layer: layer.into(),
            uid,
        }
    }

    /// Returns the database file name for persistent backends:
    /// `<layer>.db`, or `<layer>-<uid>.db` for user layers.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self.uid {
            Some(uid) => format!("{}-{uid}.db", self.layer),
            None => format!("{}.db", self.layer),
        }
    }
}

impl fmt::Display for DbId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uid {
            Some(uid) => write!(formatter, "{}-{uid}", self.layer),
            None => formatter.write_str(&self.layer),
        }
    }
}

/// A `(group, name?)` pair addressing a record inside one layer database.
///
/// A key without a name is the group sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoredKey {
    /// Group name.
    pub group: String,
    /// Value name; `None` for the group sentinel.
    pub name: Option<String>,
}

impl StoredKey {
    /// Builds a key addressing a named value.
    #[must_use]
    pub fn value(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: Some(name.into()),
        }
    }

    /// Builds a key addressing a group sentinel.
    #[must_use]
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: None,
        }
    }
}

impl fmt::Display for StoredKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(formatter, "{}:{name}", self.group),
            None => formatter.write_str(&self.group),
        }
    }
}

/// A stored value together with its access-control label.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// The value.
    pub value: Value,
    /// Label governing access to the value.
    pub label: Label,
}

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A database file could not be opened or created.
    #[error("failed to open database '{path}': {message}")]
    Open { path: Utf8PathBuf, message: String },
    /// An operation against an open database failed.
    #[error("storage failure on '{db}': {message}")]
    Storage { db: String, message: String },
    /// A stored record did not round-trip through the record codec.
    #[error("corrupt record for '{key}' in '{db}'")]
    CorruptRecord { db: String, key: String },
}

impl BackendError {
    /// Builds a storage error from any displayable source.
    #[must_use]
    pub fn storage(db: &DbId, message: impl fmt::Display) -> Self {
        Self::Storage {
            db: db.to_string(),
            message: message.to_string(),
        }
    }
}

/// The four storage capabilities every backend provides.
///
/// Teardown is the fifth, implicit capability: dropping a backend releases
/// every database it opened.
pub trait StorageBackend: Send {
    /// Reads one record.
    fn get(&mut self, db: &DbId, key: &StoredKey) -> Result<Option<StoredRecord>, BackendError>;

    /// Writes one record, replacing any previous value and label.
    fn set(
        &mut self,
        db: &DbId,
        key: &StoredKey,
        value: Value,
        label: Label,
    ) -> Result<(), BackendError>;

    /// Removes records.
    ///
    /// Removing a named value removes that record alone. Removing a group
    /// sentinel removes the sentinel and every member of the group in one
    /// atomic step. Returns the keys actually removed.
    fn unset(&mut self, db: &DbId, key: &StoredKey) -> Result<Vec<StoredKey>, BackendError>;

    /// Enumerates every key in the database.
    fn list(&mut self, db: &DbId) -> Result<Vec<StoredKey>, BackendError>;
}

/// Lazily populated map from backend kind to live backend instance.
pub struct BackendRegistry {
    db_root: Utf8PathBuf,
    loaded: HashMap<BackendKind, Box<dyn StorageBackend>>,
}

impl BackendRegistry {
    /// Creates a registry rooted at the given database directory.
    #[must_use]
    pub fn new(db_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            db_root: db_root.into(),
            loaded: HashMap::new(),
        }
    }

    /// Returns the database root directory.
    #[must_use]
    pub fn db_root(&self) -> &Utf8Path {
        self.db_root.as_path()
    }

    /// Returns the backend for `kind`, opening it on first reference.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the backend cannot be initialised; the
    /// registry stays unpopulated so the next request retries.
    pub fn backend_for(
        &mut self,
        kind: BackendKind,
    ) -> Result<&mut (dyn StorageBackend + 'static), BackendError> {
        if !self.loaded.contains_key(&kind) {
            let backend: Box<dyn StorageBackend> = match kind {
                BackendKind::Memory => Box::new(MemoryBackend::new()),
                BackendKind::Persistent => Box::new(PersistentBackend::new(self.db_root.clone())?),
            };
            debug!(target: REGISTRY_TARGET, backend = %kind, "backend loaded");
            self.loaded.insert(kind, backend);
        }
        // The entry was just inserted when absent.
        self.loaded
            .get_mut(&kind)
            .map(Box::as_mut)
            .ok_or_else(move || BackendError::Storage {
                db: kind.to_string(),
                message: "backend vanished from registry".to_string(),
            })
    }

    /// Drops every loaded backend. Calling this twice is a no-op.
    pub fn teardown(&mut self) {
        if !self.loaded.is_empty() {
            debug!(
                target: REGISTRY_TARGET,
                count = self.loaded.len(),
                "tearing down backends"
            );
        }
        self.loaded.clear();
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BackendRegistry")
            .field("db_root", &self.db_root)
            .field("loaded", &self.loaded.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_file_names_carry_the_uid_suffix_for_user_layers() {
        assert_eq!(DbId::new("base", None).file_name(), "base.db");
        assert_eq!(DbId::new("desktop", Some(1000)).file_name(), "desktop-1000.db");
    }

    #[test]
    fn registry_loads_each_backend_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let mut registry = BackendRegistry::new(root);

        let db = DbId::new("base", None);
        let key = StoredKey::group("net");
        registry
            .backend_for(BackendKind::Memory)
            .expect("load memory backend")
            .set(&db, &key, Value::String("v".into()), Label::default())
            .expect("set");

        // A second reference sees the same instance and therefore the data.
        let record = registry
            .backend_for(BackendKind::Memory)
            .expect("cached memory backend")
            .get(&db, &key)
            .expect("get");
        assert!(record.is_some());
    }

    #[test]
    fn teardown_twice_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let mut registry = BackendRegistry::new(root);
        registry.backend_for(BackendKind::Memory).expect("load");
        registry.teardown();
        registry.teardown();
    }
}
