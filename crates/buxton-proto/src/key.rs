//! Key triples addressing groups and values inside layers.

use std::fmt;

use thiserror::Error;

/// Errors raised when constructing a [`Key`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// A key component was empty.
    #[error("key component '{0}' must not be empty")]
    EmptyComponent(&'static str),
    /// A key component carried an embedded NUL byte.
    #[error("key component '{0}' contains a NUL byte")]
    EmbeddedNul(&'static str),
}

/// A `(layer?, group, name?)` triple addressing a record.
///
/// `layer` is optional for reads, where its absence triggers cross-layer
/// resolution, and mandatory for mutations. A key without a `name` denotes
/// the group itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    layer: Option<String>,
    group: String,
    name: Option<String>,
}

impl Key {
    /// Builds a key, validating every supplied component.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when a component is empty or contains NUL.
    pub fn new(
        layer: Option<impl Into<String>>,
        group: impl Into<String>,
        name: Option<impl Into<String>>,
    ) -> Result<Self, KeyError> {
        let layer = layer.map(Into::into);
        let group = group.into();
        let name = name.map(Into::into);

        if let Some(layer) = layer.as_deref() {
            validate_component("layer", layer)?;
        }
        validate_component("group", &group)?;
        if let Some(name) = name.as_deref() {
            validate_component("name", name)?;
        }

        Ok(Self { layer, group, name })
    }

    /// Builds a group sentinel key within a layer.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when a component is invalid.
    pub fn group(layer: impl Into<String>, group: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(Some(layer), group, None::<String>)
    }

    /// Returns the layer name, when bound.
    #[must_use]
    pub fn layer(&self) -> Option<&str> {
        self.layer.as_deref()
    }

    /// Returns the group name.
    #[must_use]
    pub fn group_name(&self) -> &str {
        self.group.as_str()
    }

    /// Returns the value name, or `None` for a group sentinel key.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns `true` when this key denotes the group itself.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.name.is_none()
    }

    /// Returns the sentinel key of this key's group, preserving the layer.
    #[must_use]
    pub fn to_group(&self) -> Self {
        Self {
            layer: self.layer.clone(),
            group: self.group.clone(),
            name: None,
        }
    }

    /// Returns a copy of this key bound to the given layer.
    #[must_use]
    pub fn in_layer(&self, layer: &str) -> Self {
        Self {
            layer: Some(layer.to_string()),
            group: self.group.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(layer) = &self.layer {
            write!(formatter, "{layer}:")?;
        }
        formatter.write_str(&self.group)?;
        if let Some(name) = &self.name {
            write!(formatter, ":{name}")?;
        }
        Ok(())
    }
}

fn validate_component(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::EmptyComponent(field));
    }
    if value.as_bytes().contains(&0) {
        return Err(KeyError::EmbeddedNul(field));
    }
    Ok(())
}
