//! Process-lifetime in-memory storage module.

use std::collections::{BTreeMap, HashMap};

use buxton_proto::{Label, Value};

use crate::backend::{BackendError, DbId, StorageBackend, StoredKey, StoredRecord};

/// In-memory backend: one ordered map per layer database.
///
/// Contents live for the lifetime of the process and are never written to
/// disk.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    databases: HashMap<DbId, BTreeMap<StoredKey, StoredRecord>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&mut self, db: &DbId, key: &StoredKey) -> Result<Option<StoredRecord>, BackendError> {
        Ok(self
            .databases
            .get(db)
            .and_then(|records| records.get(key))
            .cloned())
    }

    fn set(
        &mut self,
        db: &DbId,
        key: &StoredKey,
        value: Value,
        label: Label,
    ) -> Result<(), BackendError> {
        self.databases
            .entry(db.clone())
            .or_default()
            .insert(key.clone(), StoredRecord { value, label });
        Ok(())
    }

    fn unset(&mut self, db: &DbId, key: &StoredKey) -> Result<Vec<StoredKey>, BackendError> {
        let Some(records) = self.databases.get_mut(db) else {
            return Ok(Vec::new());
        };

        if key.name.is_some() {
            return Ok(records.remove(key).map(|_| key.clone()).into_iter().collect());
        }

        // Group removal takes the sentinel and every member with it.
        let doomed: Vec<StoredKey> = records
            .keys()
            .filter(|candidate| candidate.group == key.group)
            .cloned()
            .collect();
        for candidate in &doomed {
            records.remove(candidate);
        }
        Ok(doomed)
    }

    fn list(&mut self, db: &DbId) -> Result<Vec<StoredKey>, BackendError> {
        Ok(self
            .databases
            .get(db)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> DbId {
        DbId::new("base", None)
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut backend = MemoryBackend::new();
        let key = StoredKey::value("net", "mtu");
        backend
            .set(&db(), &key, Value::Int32(1500), Label::default())
            .expect("set");
        let record = backend.get(&db(), &key).expect("get").expect("present");
        assert_eq!(record.value, Value::Int32(1500));
    }

    #[test]
    fn databases_are_isolated_by_uid() {
        let mut backend = MemoryBackend::new();
        let key = StoredKey::value("app", "theme");
        let alice = DbId::new("desktop", Some(1000));
        let bob = DbId::new("desktop", Some(1001));
        backend
            .set(&alice, &key, Value::String("dark".into()), Label::default())
            .expect("set");
        assert!(backend.get(&bob, &key).expect("get").is_none());
    }

    #[test]
    fn group_unset_removes_sentinel_and_members() {
        let mut backend = MemoryBackend::new();
        backend
            .set(&db(), &StoredKey::group("net"), Value::String("g".into()), Label::default())
            .expect("set sentinel");
        backend
            .set(&db(), &StoredKey::value("net", "mtu"), Value::Int32(1500), Label::default())
            .expect("set mtu");
        backend
            .set(&db(), &StoredKey::value("other", "x"), Value::Int32(1), Label::default())
            .expect("set unrelated");

        let removed = backend.unset(&db(), &StoredKey::group("net")).expect("unset");
        assert_eq!(removed.len(), 2);
        assert!(backend.get(&db(), &StoredKey::value("net", "mtu")).expect("get").is_none());
        assert!(backend.get(&db(), &StoredKey::value("other", "x")).expect("get").is_some());
    }

    #[test]
    fn unset_of_missing_value_removes_nothing() {
        let mut backend = MemoryBackend::new();
        let removed = backend
            .unset(&db(), &StoredKey::value("net", "mtu"))
            .expect("unset");
        assert!(removed.is_empty());
    }
}
