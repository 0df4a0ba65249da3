//! On-disk storage module backed by `redb`.
//!
//! Each layer database is one `redb` file under the configured root,
//! named `<layer>.db` or `<layer>-<uid>.db` for user layers. Records live
//! in a single table keyed by `group` (sentinels) or `group\0name`
//! (members); the NUL separator cannot collide with key components, which
//! never contain NUL. Group removal happens inside one write transaction,
//! which is what makes it atomic.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use redb::{Database, ReadableTable, TableDefinition};

use buxton_proto::{DataType, Label, Value};

use crate::backend::{BackendError, DbId, StorageBackend, StoredKey, StoredRecord};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Persistent backend: one `redb` database per layer identity.
pub struct PersistentBackend {
    root: Utf8PathBuf,
    databases: HashMap<DbId, Database>,
}

impl PersistentBackend {
    /// Creates the backend, ensuring the database root directory exists.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] when the root cannot be created.
    pub fn new(root: Utf8PathBuf) -> Result<Self, BackendError> {
        std::fs::create_dir_all(&root).map_err(|error| BackendError::Open {
            path: root.clone(),
            message: error.to_string(),
        })?;
        Ok(Self {
            root,
            databases: HashMap::new(),
        })
    }

    fn database(&mut self, db: &DbId) -> Result<&Database, BackendError> {
        if !self.databases.contains_key(db) {
            let path = self.root.join(db.file_name());
            let database = Database::create(&path).map_err(|error| BackendError::Open {
                path: path.clone(),
                message: error.to_string(),
            })?;
            // Materialise the table so reads never race its creation.
            let txn = database
                .begin_write()
                .map_err(|error| BackendError::storage(db, error))?;
            txn.open_table(RECORDS)
                .map_err(|error| BackendError::storage(db, error))?;
            txn.commit()
                .map_err(|error| BackendError::storage(db, error))?;
            self.databases.insert(db.clone(), database);
        }
        self.databases
            .get(db)
            .ok_or_else(|| BackendError::storage(db, "database vanished from cache"))
    }
}

impl StorageBackend for PersistentBackend {
    fn get(&mut self, db: &DbId, key: &StoredKey) -> Result<Option<StoredRecord>, BackendError> {
        let database = self.database(db)?;
        let txn = database
            .begin_read()
            .map_err(|error| BackendError::storage(db, error))?;
        let table = txn
            .open_table(RECORDS)
            .map_err(|error| BackendError::storage(db, error))?;
        let guard = table
            .get(table_key(key).as_str())
            .map_err(|error| BackendError::storage(db, error))?;
        guard
            .map(|raw| decode_record(db, key, raw.value()))
            .transpose()
    }

    fn set(
        &mut self,
        db: &DbId,
        key: &StoredKey,
        value: Value,
        label: Label,
    ) -> Result<(), BackendError> {
        let encoded = encode_record(db, key, &value, &label)?;
        let database = self.database(db)?;
        let txn = database
            .begin_write()
            .map_err(|error| BackendError::storage(db, error))?;
        {
            let mut table = txn
                .open_table(RECORDS)
                .map_err(|error| BackendError::storage(db, error))?;
            table
                .insert(table_key(key).as_str(), encoded.as_slice())
                .map_err(|error| BackendError::storage(db, error))?;
        }
        txn.commit()
            .map_err(|error| BackendError::storage(db, error))
    }

    fn unset(&mut self, db: &DbId, key: &StoredKey) -> Result<Vec<StoredKey>, BackendError> {
        let database = self.database(db)?;
        let txn = database
            .begin_write()
            .map_err(|error| BackendError::storage(db, error))?;
        let removed = {
            let mut table = txn
                .open_table(RECORDS)
                .map_err(|error| BackendError::storage(db, error))?;

            let doomed: Vec<String> = if key.name.is_some() {
                vec![table_key(key)]
            } else {
                let mut keys = Vec::new();
                let iter = table
                    .iter()
                    .map_err(|error| BackendError::storage(db, error))?;
                for item in iter {
                    let (raw_key, _) = item.map_err(|error| BackendError::storage(db, error))?;
                    if in_group(raw_key.value(), &key.group) {
                        keys.push(raw_key.value().to_string());
                    }
                }
                keys
            };

            let mut removed = Vec::new();
            for raw in doomed {
                let previous = table
                    .remove(raw.as_str())
                    .map_err(|error| BackendError::storage(db, error))?;
                if previous.is_some() {
                    removed.push(parse_table_key(&raw));
                }
            }
            removed
        };
        txn.commit()
            .map_err(|error| BackendError::storage(db, error))?;
        Ok(removed)
    }

    fn list(&mut self, db: &DbId) -> Result<Vec<StoredKey>, BackendError> {
        let database = self.database(db)?;
        let txn = database
            .begin_read()
            .map_err(|error| BackendError::storage(db, error))?;
        let table = txn
            .open_table(RECORDS)
            .map_err(|error| BackendError::storage(db, error))?;
        let mut keys = Vec::new();
        let iter = table
            .iter()
            .map_err(|error| BackendError::storage(db, error))?;
        for item in iter {
            let (raw_key, _) = item.map_err(|error| BackendError::storage(db, error))?;
            keys.push(parse_table_key(raw_key.value()));
        }
        Ok(keys)
    }
}

fn table_key(key: &StoredKey) -> String {
    match &key.name {
        Some(name) => format!("{}\0{name}", key.group),
        None => key.group.clone(),
    }
}

fn parse_table_key(raw: &str) -> StoredKey {
    match raw.split_once('\0') {
        Some((group, name)) => StoredKey::value(group, name),
        None => StoredKey::group(raw),
    }
}

fn in_group(raw_key: &str, group: &str) -> bool {
    raw_key == group
        || (raw_key.len() > group.len()
            && raw_key.starts_with(group)
            && raw_key.as_bytes()[group.len()] == 0)
}

/// Record layout: `type:u32 | label_len:u32 | label | payload`, all
/// little-endian.
fn encode_record(
    db: &DbId,
    key: &StoredKey,
    value: &Value,
    label: &Label,
) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    out.extend_from_slice(&value.data_type().wire_id().to_le_bytes());
    out.extend_from_slice(&(label.as_str().len() as u32).to_le_bytes());
    out.extend_from_slice(label.as_str().as_bytes());
    value
        .write_payload(&mut out)
        .map_err(|_| corrupt(db, key))?;
    Ok(out)
}

fn decode_record(db: &DbId, key: &StoredKey, raw: &[u8]) -> Result<StoredRecord, BackendError> {
    if raw.len() < 8 {
        return Err(corrupt(db, key));
    }
    let data_type = u32::from_le_bytes(raw[0..4].try_into().map_err(|_| corrupt(db, key))?);
    let data_type = DataType::from_wire(data_type).ok_or_else(|| corrupt(db, key))?;
    let label_len =
        u32::from_le_bytes(raw[4..8].try_into().map_err(|_| corrupt(db, key))?) as usize;
    let label_end = 8_usize.checked_add(label_len).ok_or_else(|| corrupt(db, key))?;
    if raw.len() < label_end {
        return Err(corrupt(db, key));
    }
    let label = std::str::from_utf8(&raw[8..label_end])
        .ok()
        .and_then(|text| Label::new(text).ok())
        .ok_or_else(|| corrupt(db, key))?;
    let value =
        Value::decode_payload(data_type, &raw[label_end..]).map_err(|_| corrupt(db, key))?;
    Ok(StoredRecord { value, label })
}

fn corrupt(db: &DbId, key: &StoredKey) -> BackendError {
    BackendError::CorruptRecord {
        db: db.to_string(),
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    struct Scratch {
        backend: PersistentBackend,
        _dir: tempfile::TempDir,
    }

    #[fixture]
    fn scratch() -> Scratch {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        Scratch {
            backend: PersistentBackend::new(root).expect("backend"),
            _dir: dir,
        }
    }

    fn db() -> DbId {
        DbId::new("base", None)
    }

    #[rstest]
    fn records_survive_a_round_trip(mut scratch: Scratch) {
        let key = StoredKey::value("net", "mtu");
        scratch
            .backend
            .set(&db(), &key, Value::Int32(1500), Label::default())
            .expect("set");
        let record = scratch
            .backend
            .get(&db(), &key)
            .expect("get")
            .expect("present");
        assert_eq!(record.value, Value::Int32(1500));
        assert_eq!(record.label, Label::default());
    }

    #[rstest]
    fn records_survive_reopening_the_file(scratch: Scratch) {
        let Scratch { mut backend, _dir } = scratch;
        let key = StoredKey::value("net", "hostname");
        backend
            .set(&db(), &key, Value::String("relay".into()), Label::default())
            .expect("set");
        let root = backend.root.clone();
        drop(backend);

        let mut reopened = PersistentBackend::new(root).expect("reopen");
        let record = reopened.get(&db(), &key).expect("get").expect("present");
        assert_eq!(record.value, Value::String("relay".into()));
    }

    #[rstest]
    fn group_unset_is_atomic_and_reports_every_key(mut scratch: Scratch) {
        let sentinel = StoredKey::group("net");
        scratch
            .backend
            .set(&db(), &sentinel, Value::String("g".into()), Label::default())
            .expect("set sentinel");
        scratch
            .backend
            .set(&db(), &StoredKey::value("net", "mtu"), Value::Int32(1500), Label::default())
            .expect("set mtu");
        scratch
            .backend
            .set(
                &db(),
                &StoredKey::value("network", "x"),
                Value::Int32(1),
                Label::default(),
            )
            .expect("set prefix sibling");

        let mut removed = scratch.backend.unset(&db(), &sentinel).expect("unset");
        removed.sort();
        assert_eq!(
            removed,
            vec![StoredKey::group("net"), StoredKey::value("net", "mtu")]
        );
        // A group that merely shares a name prefix is untouched.
        assert!(
            scratch
                .backend
                .get(&db(), &StoredKey::value("network", "x"))
                .expect("get")
                .is_some()
        );
    }

    #[rstest]
    fn list_enumerates_sentinels_and_members(mut scratch: Scratch) {
        scratch
            .backend
            .set(&db(), &StoredKey::group("net"), Value::String("g".into()), Label::default())
            .expect("set");
        scratch
            .backend
            .set(&db(), &StoredKey::value("net", "mtu"), Value::Int32(1500), Label::default())
            .expect("set");
        let mut keys = scratch.backend.list(&db()).expect("list");
        keys.sort();
        assert_eq!(
            keys,
            vec![StoredKey::group("net"), StoredKey::value("net", "mtu")]
        );
    }

    #[rstest]
    fn user_databases_get_their_own_files(mut scratch: Scratch) {
        let user_db = DbId::new("desktop", Some(1000));
        scratch
            .backend
            .set(
                &user_db,
                &StoredKey::group("app"),
                Value::String("g".into()),
                Label::default(),
            )
            .expect("set");
        assert!(scratch.backend.root.join("desktop-1000.db").exists());
    }
}
