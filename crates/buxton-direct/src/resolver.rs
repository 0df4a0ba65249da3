//! Layered resolution with access control.
//!
//! [`Control`] owns the configured layers, the backend registry and the
//! Smack rule cache, and executes every operation of the database against
//! them. The daemon drives a `Control` on behalf of socket clients;
//! privileged callers drive one in-process, which is the direct path.
//!
//! Callers are represented by a uid and an optional label. A caller with
//! no label is direct and bypasses every label check; the uid still
//! selects user-layer databases and still gates system-layer mutations.

use std::env;

use tracing::debug;

use buxton_config::{LayerConfig, LayerKind, ROOT_CHECK_ENV};
use buxton_proto::{Key, Label, Value};

use crate::backend::{BackendRegistry, DbId, StoredKey, StoredRecord};
use crate::error::DirectError;
use crate::smack::{AccessMode, SmackCache};

const RESOLVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::resolver");

/// Placeholder value stored in group sentinel records.
pub const GROUP_VALUE: &str = "BUXTON_GROUP_VALUE";

/// The caller an operation runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Effective uid; binds user-layer databases and the root rule.
    pub uid: u32,
    /// Access-control label; `None` for direct callers, which disables
    /// label checks.
    pub label: Option<Label>,
}

impl Caller {
    /// A direct, in-process caller.
    #[must_use]
    pub fn direct(uid: u32) -> Self {
        Self { uid, label: None }
    }

    /// A socket caller with a kernel-provided label.
    #[must_use]
    pub fn labelled(uid: u32, label: Label) -> Self {
        Self {
            uid,
            label: Some(label),
        }
    }
}

/// A change record produced by a successful mutation, destined for the
/// notifier. A `None` change means the key was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Fanout {
    /// Layer the mutation landed in.
    pub layer: String,
    /// Group of the mutated key.
    pub group: String,
    /// Name of the mutated key; `None` for the group sentinel.
    pub name: Option<String>,
    /// New value and label, or `None` when the key was removed.
    pub change: Option<(Value, Label)>,
}

/// The layered configuration database: layers, backends and rules.
#[derive(Debug)]
pub struct Control {
    layers: Vec<LayerConfig>,
    registry: BackendRegistry,
    smack: SmackCache,
}

impl Control {
    /// Opens a control over the given layers.
    ///
    /// Layer order is the configuration-file order and fixes cross-layer
    /// tie-breaking. Backends open lazily on first use.
    #[must_use]
    pub fn open(layers: Vec<LayerConfig>, registry: BackendRegistry, smack: SmackCache) -> Self {
        Self {
            layers,
            registry,
            smack,
        }
    }

    /// Returns the configured layers in insertion order.
    #[must_use]
    pub fn layers(&self) -> &[LayerConfig] {
        &self.layers
    }

    /// Returns the rule cache.
    #[must_use]
    pub fn smack(&self) -> &SmackCache {
        &self.smack
    }

    /// Returns the rule cache for reloading and watch management.
    #[must_use]
    pub fn smack_mut(&mut self) -> &mut SmackCache {
        &mut self.smack
    }

    /// Shuts down every loaded backend. Safe to call more than once.
    pub fn close(&mut self) {
        self.registry.teardown();
    }

    /// Reads a value, resolving across layers when the key names none.
    ///
    /// Cross-layer resolution scans layers in configuration order and keeps
    /// the candidate from the highest-ranking layer that holds the key:
    /// system layers outrank user layers, higher priority outranks lower
    /// within a kind, and the earliest configured layer wins ties. Layers
    /// that fail the read are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] when no layer holds the key or a label check
    /// fails in the addressed layer.
    pub fn get(&mut self, caller: &Caller, key: &Key) -> Result<StoredRecord, DirectError> {
        if key.layer().is_some() {
            return self.get_in_layer(caller, key);
        }

        let mut best: Option<(LayerKind, u32, StoredRecord)> = None;
        for index in 0..self.layers.len() {
            let layer = self.layers[index].clone();
            let candidate_key = key.in_layer(&layer.name);
            let Ok(record) = self.get_in_layer(caller, &candidate_key) else {
                continue;
            };
            let outranks = match &best {
                None => true,
                Some((best_kind, best_priority, _)) => match (layer.kind, *best_kind) {
                    (LayerKind::System, LayerKind::User) => true,
                    (LayerKind::User, LayerKind::System) => false,
                    _ => layer.priority > *best_priority,
                },
            };
            if outranks {
                best = Some((layer.kind, layer.priority, record));
            }
        }

        best.map(|(_, _, record)| record)
            .ok_or_else(|| DirectError::NotFound(key.to_string()))
    }

    /// Reads a value from the layer the key names.
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] when the layer or key is missing, the key's
    /// group does not exist, or the caller's label fails a READ check
    /// against the group or value label.
    pub fn get_in_layer(
        &mut self,
        caller: &Caller,
        key: &Key,
    ) -> Result<StoredRecord, DirectError> {
        let layer = self.layer_for_key(key)?.clone();
        let db = db_id(&layer, caller);

        // Groups are created first; a keyed read under a missing group
        // fails before touching the value.
        if key.name().is_some() {
            let sentinel = self
                .fetch(&layer, &db, &StoredKey::group(key.group_name()))?
                .ok_or_else(|| DirectError::GroupNotFound(key.group_name().to_string()))?;
            if let Some(label) = &caller.label
                && !self.smack.may_access(label, &sentinel.label, AccessMode::Read)
            {
                return Err(DirectError::PermissionDenied(key.to_string()));
            }
        }

        let record = self
            .fetch(&layer, &db, &stored_key(key))?
            .ok_or_else(|| DirectError::NotFound(key.to_string()))?;
        if let Some(label) = &caller.label
            && !self.smack.may_access(label, &record.label, AccessMode::Read)
        {
            return Err(DirectError::PermissionDenied(key.to_string()));
        }
        Ok(record)
    }

    /// Writes a value into the layer the key names.
    ///
    /// When the value already exists its label is retained, so the first
    /// writer fixes the label for the lifetime of the value. A new value
    /// adopts the caller's label, or the default label for direct callers.
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] when the group sentinel is missing or a
    /// WRITE check against the group or existing value label fails.
    pub fn set(&mut self, caller: &Caller, key: &Key, value: Value) -> Result<Fanout, DirectError> {
        let layer = self.layer_for_key(key)?.clone();
        let Some(name) = key.name() else {
            return Err(DirectError::BadKey(key.to_string()));
        };
        let name = name.to_string();
        let db = db_id(&layer, caller);

        let sentinel = self
            .fetch(&layer, &db, &StoredKey::group(key.group_name()))?
            .ok_or_else(|| DirectError::GroupNotFound(key.group_name().to_string()))?;
        let existing = self.fetch(&layer, &db, &stored_key(key))?;

        let label = match (&caller.label, existing) {
            (Some(caller_label), existing) => {
                if !self
                    .smack
                    .may_access(caller_label, &sentinel.label, AccessMode::Write)
                {
                    return Err(DirectError::PermissionDenied(key.to_string()));
                }
                match existing {
                    Some(existing) => {
                        if !self
                            .smack
                            .may_access(caller_label, &existing.label, AccessMode::Write)
                        {
                            return Err(DirectError::PermissionDenied(key.to_string()));
                        }
                        existing.label
                    }
                    None => caller_label.clone(),
                }
            }
            (None, Some(existing)) => existing.label,
            (None, None) => Label::default(),
        };

        self.registry.backend_for(layer.backend)?.set(
            &db,
            &stored_key(key),
            value.clone(),
            label.clone(),
        )?;
        debug!(target: RESOLVER_TARGET, %key, "value set");

        Ok(Fanout {
            layer: layer.name,
            group: key.group_name().to_string(),
            name: Some(name),
            change: Some((value, label)),
        })
    }

    /// Removes a single value from the layer the key names.
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] when the group or value is missing, or a
    /// WRITE check against the group or value label fails.
    pub fn unset(&mut self, caller: &Caller, key: &Key) -> Result<Fanout, DirectError> {
        let layer = self.layer_for_key(key)?.clone();
        let Some(name) = key.name() else {
            return Err(DirectError::BadKey(key.to_string()));
        };
        let name = name.to_string();
        let db = db_id(&layer, caller);

        let sentinel = self
            .fetch(&layer, &db, &StoredKey::group(key.group_name()))?
            .ok_or_else(|| DirectError::GroupNotFound(key.group_name().to_string()))?;
        if let Some(caller_label) = &caller.label
            && !self
                .smack
                .may_access(caller_label, &sentinel.label, AccessMode::Write)
        {
            return Err(DirectError::PermissionDenied(key.to_string()));
        }

        let existing = self
            .fetch(&layer, &db, &stored_key(key))?
            .ok_or_else(|| DirectError::NotFound(key.to_string()))?;
        if let Some(caller_label) = &caller.label
            && !self
                .smack
                .may_access(caller_label, &existing.label, AccessMode::Write)
        {
            return Err(DirectError::PermissionDenied(key.to_string()));
        }

        self.registry
            .backend_for(layer.backend)?
            .unset(&db, &stored_key(key))?;
        debug!(target: RESOLVER_TARGET, %key, "value unset");

        Ok(Fanout {
            layer: layer.name,
            group: key.group_name().to_string(),
            name: Some(name),
            change: None,
        })
    }

    /// Creates a group sentinel.
    ///
    /// System layers demand a root caller unless the root check is
    /// disabled via the environment. The sentinel stores the supplied
    /// label, or the default label when the caller brings none.
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] for non-root callers on system layers and
    /// when the group already exists.
    pub fn create_group(
        &mut self,
        caller: &Caller,
        key: &Key,
        label: Option<Label>,
    ) -> Result<Fanout, DirectError> {
        let layer = self.layer_for_key(key)?.clone();
        if key.name().is_some() {
            return Err(DirectError::BadKey(key.to_string()));
        }
        enforce_root_rule(&layer, caller, key)?;
        let db = db_id(&layer, caller);

        if self.fetch(&layer, &db, &stored_key(key))?.is_some() {
            return Err(DirectError::AlreadyExists(key.group_name().to_string()));
        }

        let label = label.unwrap_or_default();
        let value = Value::String(GROUP_VALUE.to_string());
        self.registry.backend_for(layer.backend)?.set(
            &db,
            &stored_key(key),
            value.clone(),
            label.clone(),
        )?;
        debug!(target: RESOLVER_TARGET, %key, "group created");

        Ok(Fanout {
            layer: layer.name,
            group: key.group_name().to_string(),
            name: None,
            change: Some((value, label)),
        })
    }

    /// Removes a group and every key beneath it, atomically.
    ///
    /// System layers demand a root caller; user layers demand WRITE on the
    /// group label for labelled callers. One fanout record is produced per
    /// removed key.
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] when the group is missing or a permission
    /// check fails.
    pub fn remove_group(
        &mut self,
        caller: &Caller,
        key: &Key,
    ) -> Result<Vec<Fanout>, DirectError> {
        let layer = self.layer_for_key(key)?.clone();
        if key.name().is_some() {
            return Err(DirectError::BadKey(key.to_string()));
        }
        enforce_root_rule(&layer, caller, key)?;
        let db = db_id(&layer, caller);

        let sentinel = self
            .fetch(&layer, &db, &stored_key(key))?
            .ok_or_else(|| DirectError::GroupNotFound(key.group_name().to_string()))?;
        if layer.kind == LayerKind::User
            && let Some(caller_label) = &caller.label
            && !self
                .smack
                .may_access(caller_label, &sentinel.label, AccessMode::Write)
        {
            return Err(DirectError::PermissionDenied(key.to_string()));
        }

        let removed = self
            .registry
            .backend_for(layer.backend)?
            .unset(&db, &stored_key(key))?;
        debug!(
            target: RESOLVER_TARGET,
            %key,
            removed = removed.len(),
            "group removed"
        );

        Ok(removed
            .into_iter()
            .map(|stored| Fanout {
                layer: layer.name.clone(),
                group: stored.group,
                name: stored.name,
                change: None,
            })
            .collect())
    }

    /// Replaces the label on an existing group or value.
    ///
    /// Labels may only be rewritten in system layers, and only by root
    /// (subject to the environment override).
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] for user layers, non-root callers and
    /// missing targets.
    pub fn set_label(
        &mut self,
        caller: &Caller,
        key: &Key,
        label: Label,
    ) -> Result<(), DirectError> {
        let layer = self.layer_for_key(key)?.clone();
        if layer.kind != LayerKind::System {
            return Err(DirectError::PermissionDenied(key.to_string()));
        }
        enforce_root_rule(&layer, caller, key)?;
        let db = db_id(&layer, caller);

        let existing = self
            .fetch(&layer, &db, &stored_key(key))?
            .ok_or_else(|| DirectError::NotFound(key.to_string()))?;

        self.registry
            .backend_for(layer.backend)?
            .set(&db, &stored_key(key), existing.value, label)?;
        debug!(target: RESOLVER_TARGET, %key, "label replaced");
        Ok(())
    }

    /// Enumerates every key in a layer. No per-key checks apply; the
    /// surface is already restricted to the named layer.
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] for unknown layers and backend failures.
    pub fn list(&mut self, caller: &Caller, layer_name: &str) -> Result<Vec<StoredKey>, DirectError> {
        let layer = self.layer(layer_name)?.clone();
        let db = db_id(&layer, caller);
        Ok(self.registry.backend_for(layer.backend)?.list(&db)?)
    }

    fn layer(&self, name: &str) -> Result<&LayerConfig, DirectError> {
        self.layers
            .iter()
            .find(|layer| layer.name == name)
            .ok_or_else(|| DirectError::UnknownLayer(name.to_string()))
    }

    fn layer_for_key(&self, key: &Key) -> Result<&LayerConfig, DirectError> {
        let name = key.layer().ok_or(DirectError::LayerRequired)?;
        self.layer(name)
    }

    fn fetch(
        &mut self,
        layer: &LayerConfig,
        db: &DbId,
        key: &StoredKey,
    ) -> Result<Option<StoredRecord>, DirectError> {
        Ok(self.registry.backend_for(layer.backend)?.get(db, key)?)
    }
}

fn db_id(layer: &LayerConfig, caller: &Caller) -> DbId {
    let uid = (layer.kind == LayerKind::User).then_some(caller.uid);
    DbId::new(layer.name.clone(), uid)
}

fn stored_key(key: &Key) -> StoredKey {
    StoredKey {
        group: key.group_name().to_string(),
        name: key.name().map(str::to_string),
    }
}

fn enforce_root_rule(
    layer: &LayerConfig,
    caller: &Caller,
    key: &Key,
) -> Result<(), DirectError> {
    if layer.kind != LayerKind::System || caller.uid == 0 || root_check_disabled() {
        return Ok(());
    }
    Err(DirectError::PermissionDenied(key.to_string()))
}

fn root_check_disabled() -> bool {
    env::var(ROOT_CHECK_ENV).is_ok_and(|value| value == "0")
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use serial_test::serial;

    use buxton_config::BackendKind;

    use super::*;

    fn label(text: &str) -> Label {
        Label::new(text).expect("valid label")
    }

    fn key(layer: Option<&str>, group: &str, name: Option<&str>) -> Key {
        Key::new(layer, group, name).expect("valid key")
    }

    fn layer_config(name: &str, kind: LayerKind, priority: u32) -> LayerConfig {
        LayerConfig {
            name: name.to_string(),
            kind,
            backend: BackendKind::Memory,
            priority,
            description: String::new(),
        }
    }

    struct World {
        control: Control,
        _dir: tempfile::TempDir,
    }

    fn world(layers: Vec<LayerConfig>, rules: &str) -> World {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules_path = dir.path().join("load2");
        std::fs::write(&rules_path, rules).expect("write rules");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let rules_path = Utf8PathBuf::from_path_buf(rules_path).expect("utf8");
        World {
            control: Control::open(
                layers,
                BackendRegistry::new(root),
                SmackCache::load(rules_path),
            ),
            _dir: dir,
        }
    }

    fn single_system_layer() -> Vec<LayerConfig> {
        vec![layer_config("base", LayerKind::System, 1)]
    }

    #[test]
    fn set_without_group_returns_not_found() {
        let mut world = world(single_system_layer(), "");
        let root = Caller::direct(0);
        let result = world.control.set(
            &root,
            &key(Some("base"), "net", Some("hostname")),
            Value::String("relay".into()),
        );
        assert!(matches!(result, Err(DirectError::GroupNotFound(_))));
    }

    #[test]
    fn set_then_get_in_layer() {
        let mut world = world(single_system_layer(), "");
        let root = Caller::direct(0);
        world
            .control
            .create_group(&root, &key(Some("base"), "net", None), None)
            .expect("create group");
        world
            .control
            .set(&root, &key(Some("base"), "net", Some("mtu")), Value::Int32(1500))
            .expect("set");

        let record = world
            .control
            .get(&root, &key(Some("base"), "net", Some("mtu")))
            .expect("get");
        assert_eq!(record.value, Value::Int32(1500));
        assert_eq!(record.label, Label::default());
    }

    #[test]
    fn first_label_sticks_across_writers() {
        let rules = "LabelA _ rw\nLabelB _ rw\nLabelB LabelA w\n";
        let mut world = world(single_system_layer(), rules);
        let root = Caller::direct(0);
        world
            .control
            .create_group(&root, &key(Some("base"), "net", None), None)
            .expect("create group");

        let writer_a = Caller::labelled(1000, label("LabelA"));
        let writer_b = Caller::labelled(1001, label("LabelB"));
        let mtu = key(Some("base"), "net", Some("mtu"));

        world
            .control
            .set(&writer_a, &mtu, Value::Int32(1500))
            .expect("first write");
        let fanout = world
            .control
            .set(&writer_b, &mtu, Value::Int32(9000))
            .expect("second write");

        let record = world.control.get(&root, &mtu).expect("get");
        assert_eq!(record.value, Value::Int32(9000));
        assert_eq!(record.label, label("LabelA"));
        assert_eq!(fanout.change, Some((Value::Int32(9000), label("LabelA"))));
    }

    #[test]
    fn writer_without_write_access_to_existing_label_is_denied() {
        let rules = "LabelA _ rw\nLabelB _ rw\n";
        let mut world = world(single_system_layer(), rules);
        let root = Caller::direct(0);
        world
            .control
            .create_group(&root, &key(Some("base"), "net", None), None)
            .expect("create group");

        let mtu = key(Some("base"), "net", Some("mtu"));
        world
            .control
            .set(&Caller::labelled(1000, label("LabelA")), &mtu, Value::Int32(1500))
            .expect("first write");
        let denied = world
            .control
            .set(&Caller::labelled(1001, label("LabelB")), &mtu, Value::Int32(9000));
        assert!(matches!(denied, Err(DirectError::PermissionDenied(_))));
    }

    #[test]
    fn remove_group_removes_every_member() {
        let mut world = world(single_system_layer(), "");
        let root = Caller::direct(0);
        let group = key(Some("base"), "net", None);
        world
            .control
            .create_group(&root, &group, None)
            .expect("create group");
        for name in ["mtu", "hostname"] {
            world
                .control
                .set(&root, &key(Some("base"), "net", Some(name)), Value::Int32(1))
                .expect("set");
        }

        let fanouts = world.control.remove_group(&root, &group).expect("remove group");
        assert_eq!(fanouts.len(), 3);
        assert!(fanouts.iter().all(|fanout| fanout.change.is_none()));

        let lookup = world.control.get(&root, &key(Some("base"), "net", Some("mtu")));
        assert!(matches!(lookup, Err(DirectError::GroupNotFound(_))));
    }

    #[test]
    fn cross_layer_get_prefers_system_then_priority_then_order() {
        let layers = vec![
            layer_config("user-low", LayerKind::User, 10),
            layer_config("sys-low", LayerKind::System, 1),
            layer_config("sys-high", LayerKind::System, 5),
            layer_config("sys-tied", LayerKind::System, 5),
        ];
        let mut world = world(layers, "");
        let root = Caller::direct(0);
        for layer in ["user-low", "sys-low", "sys-high", "sys-tied"] {
            world
                .control
                .create_group(&root, &key(Some(layer), "app", None), None)
                .expect("create group");
            world
                .control
                .set(
                    &root,
                    &key(Some(layer), "app", Some("origin")),
                    Value::String(layer.to_string()),
                )
                .expect("set");
        }

        let record = world
            .control
            .get(&root, &key(None, "app", Some("origin")))
            .expect("cross-layer get");
        // sys-high and sys-tied share a priority; the earlier layer wins.
        assert_eq!(record.value, Value::String("sys-high".into()));
    }

    #[test]
    fn cross_layer_get_falls_back_to_user_layers() {
        let layers = vec![
            layer_config("u1", LayerKind::User, 10),
            layer_config("u2", LayerKind::User, 20),
        ];
        let mut world = world(layers, "");
        let caller = Caller::direct(1000);
        for layer in ["u1", "u2"] {
            world
                .control
                .create_group(&caller, &key(Some(layer), "app", None), None)
                .expect("create group");
        }
        world
            .control
            .set(&caller, &key(Some("u1"), "app", Some("theme")), Value::String("dark".into()))
            .expect("set u1");
        world
            .control
            .set(&caller, &key(Some("u2"), "app", Some("theme")), Value::String("light".into()))
            .expect("set u2");

        let theme = key(None, "app", Some("theme"));
        let record = world.control.get(&caller, &theme).expect("get");
        assert_eq!(record.value, Value::String("light".into()));

        world
            .control
            .remove_group(&caller, &key(Some("u2"), "app", None))
            .expect("remove u2 group");
        let record = world.control.get(&caller, &theme).expect("get after removal");
        assert_eq!(record.value, Value::String("dark".into()));
    }

    #[test]
    fn labels_gate_reads_but_not_the_sentinel() {
        let rules = "Reader Visible r\n";
        let mut world = world(single_system_layer(), rules);
        let root = Caller::direct(0);
        world
            .control
            .create_group(&root, &key(Some("base"), "net", None), Some(label("Visible")))
            .expect("create group");
        world
            .control
            .set(&root, &key(Some("base"), "net", Some("secret")), Value::Int32(7))
            .expect("set");
        world
            .control
            .set_label(&root, &key(Some("base"), "net", Some("secret")), label("Hidden"))
            .expect("set label");

        let reader = Caller::labelled(1000, label("Reader"));
        let denied = world
            .control
            .get(&reader, &key(Some("base"), "net", Some("secret")));
        assert!(matches!(denied, Err(DirectError::PermissionDenied(_))));

        let sentinel = world
            .control
            .get(&reader, &key(Some("base"), "net", None))
            .expect("sentinel read");
        assert_eq!(sentinel.value, Value::String(GROUP_VALUE.into()));
    }

    #[test]
    #[serial]
    fn system_layer_mutations_require_root() {
        // The override must not linger from another test.
        unsafe { env::remove_var(ROOT_CHECK_ENV) };
        let mut world = world(single_system_layer(), "");
        let caller = Caller::direct(1000);
        let group = key(Some("base"), "net", None);

        let denied = world.control.create_group(&caller, &group, None);
        assert!(matches!(denied, Err(DirectError::PermissionDenied(_))));

        unsafe { env::set_var(ROOT_CHECK_ENV, "0") };
        let permitted = world.control.create_group(&caller, &group, None);
        unsafe { env::remove_var(ROOT_CHECK_ENV) };
        assert!(permitted.is_ok());
    }

    #[test]
    #[serial]
    fn set_label_is_system_layer_root_only() {
        unsafe { env::remove_var(ROOT_CHECK_ENV) };
        let layers = vec![
            layer_config("base", LayerKind::System, 1),
            layer_config("desk", LayerKind::User, 1),
        ];
        let mut world = world(layers, "");
        let root = Caller::direct(0);
        world
            .control
            .create_group(&root, &key(Some("base"), "net", None), None)
            .expect("create group");
        world
            .control
            .create_group(&root, &key(Some("desk"), "app", None), None)
            .expect("create user group");

        let user_layer = world
            .control
            .set_label(&root, &key(Some("desk"), "app", None), label("X"));
        assert!(matches!(user_layer, Err(DirectError::PermissionDenied(_))));

        let non_root = world.control.set_label(
            &Caller::direct(1000),
            &key(Some("base"), "net", None),
            label("X"),
        );
        assert!(matches!(non_root, Err(DirectError::PermissionDenied(_))));

        world
            .control
            .set_label(&root, &key(Some("base"), "net", None), label("TopSecret"))
            .expect("root relabels");
        let record = world
            .control
            .get(&root, &key(Some("base"), "net", None))
            .expect("get");
        assert_eq!(record.label, label("TopSecret"));
    }

    #[test]
    fn user_layers_are_partitioned_by_uid() {
        let mut world = world(vec![layer_config("desk", LayerKind::User, 1)], "");
        let alice = Caller::direct(1000);
        let bob = Caller::direct(1001);

        world
            .control
            .create_group(&alice, &key(Some("desk"), "app", None), None)
            .expect("create group");
        world
            .control
            .set(&alice, &key(Some("desk"), "app", Some("theme")), Value::String("dark".into()))
            .expect("set");

        let missing = world.control.get(&bob, &key(Some("desk"), "app", Some("theme")));
        assert!(matches!(missing, Err(DirectError::GroupNotFound(_))));
    }

    #[test]
    fn unset_of_missing_value_is_not_found() {
        let mut world = world(single_system_layer(), "");
        let root = Caller::direct(0);
        world
            .control
            .create_group(&root, &key(Some("base"), "net", None), None)
            .expect("create group");
        let result = world.control.unset(&root, &key(Some("base"), "net", Some("mtu")));
        assert!(matches!(result, Err(DirectError::NotFound(_))));
    }

    #[test]
    fn create_group_twice_already_exists() {
        let mut world = world(single_system_layer(), "");
        let root = Caller::direct(0);
        let group = key(Some("base"), "net", None);
        world
            .control
            .create_group(&root, &group, None)
            .expect("first create");
        let duplicate = world.control.create_group(&root, &group, None);
        assert!(matches!(duplicate, Err(DirectError::AlreadyExists(_))));
    }

    #[rstest]
    #[case::unknown_layer(Some("nope"), DirectErrorKind::UnknownLayer)]
    #[case::missing_layer(None, DirectErrorKind::LayerRequired)]
    fn mutations_validate_the_layer(
        #[case] layer: Option<&str>,
        #[case] expected: DirectErrorKind,
    ) {
        let mut world = world(single_system_layer(), "");
        let result = world.control.set(
            &Caller::direct(0),
            &key(layer, "net", Some("mtu")),
            Value::Int32(1),
        );
        let kind = match result {
            Err(DirectError::UnknownLayer(_)) => DirectErrorKind::UnknownLayer,
            Err(DirectError::LayerRequired) => DirectErrorKind::LayerRequired,
            other => panic!("unexpected result: {other:?}"),
        };
        assert_eq!(kind, expected);
    }

    #[derive(Debug, PartialEq, Eq)]
    enum DirectErrorKind {
        UnknownLayer,
        LayerRequired,
    }

    #[test]
    fn list_enumerates_layer_keys() {
        let mut world = world(single_system_layer(), "");
        let root = Caller::direct(0);
        world
            .control
            .create_group(&root, &key(Some("base"), "net", None), None)
            .expect("create group");
        world
            .control
            .set(&root, &key(Some("base"), "net", Some("mtu")), Value::Int32(1500))
            .expect("set");

        let keys = world.control.list(&root, "base").expect("list");
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&StoredKey::group("net")));
        assert!(keys.contains(&StoredKey::value("net", "mtu")));
    }
}
