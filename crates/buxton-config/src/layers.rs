//! Layer-configuration file parsing.
//!
//! Layers are declared in an INI-style file, one section per layer:
//!
//! ```ini
//! [base]
//! Type = System
//! Backend = persistent
//! Priority = 1
//! Description = Base system configuration
//! ```
//!
//! Section order is significant: it fixes the insertion order used to break
//! priority ties during cross-layer resolution, so the parser returns the
//! layers as an ordered list rather than a map.

use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Whether a layer holds system-wide or per-user settings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LayerKind {
    /// Shared system settings; mutations are restricted to root.
    System,
    /// Per-user settings; the database is selected by the caller's uid.
    User,
}

/// Storage module backing a layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    /// On-disk database, one file per layer (and per uid for user layers).
    Persistent,
    /// Process-lifetime in-memory store.
    Memory,
}

/// One configured layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerConfig {
    /// Layer name, unique within the configuration.
    pub name: String,
    /// System or user scope.
    pub kind: LayerKind,
    /// Storage module backing the layer.
    pub backend: BackendKind,
    /// Priority for cross-layer resolution; higher wins within a kind.
    pub priority: u32,
    /// Free-text description.
    pub description: String,
}

/// Errors raised while reading or parsing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A line was neither a section header, a key assignment, nor blank.
    #[error("line {line}: expected 'key = value'")]
    Malformed { line: usize },
    /// A key assignment appeared before any section header.
    #[error("line {line}: assignment outside of a layer section")]
    OrphanAssignment { line: usize },
    /// A section name was repeated.
    #[error("line {line}: duplicate layer '{name}'")]
    DuplicateLayer { line: usize, name: String },
    /// A section carried a key the format does not define.
    #[error("line {line}: unknown key '{key}'")]
    UnknownKey { line: usize, key: String },
    /// A value failed to parse for its key.
    #[error("line {line}: invalid value '{value}' for '{key}'")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    /// A section was missing one of its required keys.
    #[error("layer '{name}' is missing required key '{key}'")]
    MissingKey { name: String, key: &'static str },
    /// A section header was empty.
    #[error("line {line}: empty layer name")]
    EmptyLayerName { line: usize },
}

/// Reads and parses the layer configuration at `path`.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read or fails to parse.
pub fn load_layer_configs(path: &Utf8Path) -> Result<Vec<LayerConfig>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_layer_configs(&text)
}

/// Parses layer configuration text into ordered layer entries.
///
/// # Errors
///
/// Returns [`ConfigError`] for malformed lines, duplicate or incomplete
/// sections, and unparseable values.
pub fn parse_layer_configs(text: &str) -> Result<Vec<LayerConfig>, ConfigError> {
    let mut layers: Vec<LayerConfig> = Vec::new();
    let mut current: Option<SectionBuilder> = None;

    for (index, raw_line) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        if let Some(name) = trimmed.strip_prefix('[') {
            let name = name
                .strip_suffix(']')
                .ok_or(ConfigError::Malformed { line })?
                .trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyLayerName { line });
            }
            if let Some(section) = current.take() {
                layers.push(section.finish()?);
            }
            if layers.iter().any(|layer| layer.name == name) {
                return Err(ConfigError::DuplicateLayer {
                    line,
                    name: name.to_string(),
                });
            }
            current = Some(SectionBuilder::new(name));
            continue;
        }

        let (key, value) = trimmed
            .split_once('=')
            .ok_or(ConfigError::Malformed { line })?;
        let section = current.as_mut().ok_or(ConfigError::OrphanAssignment { line })?;
        section.assign(line, key.trim(), value.trim())?;
    }

    if let Some(section) = current.take() {
        layers.push(section.finish()?);
    }

    Ok(layers)
}

struct SectionBuilder {
    name: String,
    kind: Option<LayerKind>,
    backend: Option<BackendKind>,
    priority: Option<u32>,
    description: Option<String>,
}

impl SectionBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: None,
            backend: None,
            priority: None,
            description: None,
        }
    }

    fn assign(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => self.kind = Some(LayerKind::from_str(value).map_err(|_| invalid())?),
            "backend" => {
                self.backend = Some(BackendKind::from_str(value).map_err(|_| invalid())?);
            }
            "priority" => self.priority = Some(value.parse().map_err(|_| invalid())?),
            "description" => self.description = Some(value.to_string()),
            _ => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<LayerConfig, ConfigError> {
        let missing = |key| ConfigError::MissingKey {
            name: self.name.clone(),
            key,
        };
        Ok(LayerConfig {
            kind: self.kind.ok_or_else(|| missing("Type"))?,
            backend: self.backend.ok_or_else(|| missing("Backend"))?,
            priority: self.priority.ok_or_else(|| missing("Priority"))?,
            description: self.description.unwrap_or_default(),
            name: self.name,
        })
    }
}
