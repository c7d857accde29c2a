//! Definition containers: immutable setting definition trees.
//!
//! A definition file declares the settings a machine knows about, as a tree
//! (children refine their parent's category). Each definition carries the
//! default value (a literal or an expression), UI enablement, and the
//! multi-extruder attributes consulted during stack resolution. Files are
//! loaded once and recorded with provenance (path + SHA-256 of raw bytes).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::settings::container::{
    Container, PropertyValue, SettingProperty, SettingValue, SupportsSettingValue,
};
use crate::settings::function::SettingFunction;

/// One node of the definition tree, as declared in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingDefinition {
    /// Setting key, unique within the definition set.
    pub key: String,

    /// Display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Literal default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    /// Expression source computing the value from other settings.
    /// Takes precedence over `default_value` when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Expression source arbitrating between per-extruder values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve: Option<String>,

    /// Whether the setting is enabled in the UI.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether the setting may differ per extruder.
    #[serde(default)]
    pub settable_per_extruder: bool,

    /// Extruder index this setting is pinned to; -1 or absent means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_to_extruder: Option<i64>,

    /// Child definitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SettingDefinition>,
}

fn default_true() -> bool {
    true
}

/// On-disk definition file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DefinitionFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    settings: Vec<SettingDefinition>,
}

/// Provenance of a loaded definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSource {
    /// File path the container was loaded from.
    pub path: String,

    /// SHA-256 digest of the raw file bytes.
    pub digest: String,
}

/// Compiled per-key definition entry.
#[derive(Debug, Clone)]
struct CompiledDefinition {
    value: Option<SettingValue>,
    resolve: Option<SettingFunction>,
    enabled: bool,
    settable_per_extruder: bool,
    limit_to_extruder: Option<usize>,
}

/// An immutable container backed by a definition tree.
#[derive(Debug)]
pub struct DefinitionContainer {
    id: String,
    name: String,
    source: Option<DefinitionSource>,
    definitions: Vec<SettingDefinition>,
    compiled: HashMap<String, CompiledDefinition>,
}

/// Errors from loading definition files.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("I/O error reading '{path}': {message}")]
    Io { path: String, message: String },

    #[error("JSON parse error in '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("bad expression for setting '{key}': {message}")]
    BadExpression { key: String, message: String },

    #[error("duplicate setting key '{0}' in definition file")]
    DuplicateKey(String),
}

impl DefinitionContainer {
    /// Load a definition container from a JSON file, recording provenance.
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let bytes = fs::read(path).map_err(|e| DefinitionError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let file: DefinitionFile =
            serde_json::from_slice(&bytes).map_err(|e| DefinitionError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let source = DefinitionSource {
            path: path.display().to_string(),
            digest,
        };
        Self::build(file, Some(source))
    }

    /// Parse a definition container from a JSON string (no provenance).
    pub fn from_json_str(json: &str) -> Result<Self, DefinitionError> {
        let file: DefinitionFile = serde_json::from_str(json).map_err(|e| DefinitionError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        Self::build(file, None)
    }

    fn build(file: DefinitionFile, source: Option<DefinitionSource>) -> Result<Self, DefinitionError> {
        let mut compiled = HashMap::new();
        for definition in &file.settings {
            compile_tree(definition, &mut compiled)?;
        }

        Ok(Self {
            name: file.name.unwrap_or_else(|| file.id.clone()),
            id: file.id,
            source,
            definitions: file.settings,
            compiled,
        })
    }

    /// Root definitions, in file order.
    pub fn definitions(&self) -> &[SettingDefinition] {
        &self.definitions
    }

    /// Provenance of the backing file, if loaded from disk.
    pub fn source(&self) -> Option<&DefinitionSource> {
        self.source.as_ref()
    }
}

fn compile_tree(
    definition: &SettingDefinition,
    out: &mut HashMap<String, CompiledDefinition>,
) -> Result<(), DefinitionError> {
    let value = match &definition.value {
        Some(source) => Some(SettingValue::Function(
            SettingFunction::parse(source).map_err(|e| DefinitionError::BadExpression {
                key: definition.key.clone(),
                message: e.to_string(),
            })?,
        )),
        None => definition
            .default_value
            .clone()
            .map(SettingValue::Literal),
    };

    let resolve = match &definition.resolve {
        Some(source) => Some(SettingFunction::parse(source).map_err(|e| {
            DefinitionError::BadExpression {
                key: definition.key.clone(),
                message: e.to_string(),
            }
        })?),
        None => None,
    };

    let limit_to_extruder = definition
        .limit_to_extruder
        .filter(|index| *index >= 0)
        .map(|index| index as usize);

    let entry = CompiledDefinition {
        value,
        resolve,
        enabled: definition.enabled,
        settable_per_extruder: definition.settable_per_extruder,
        limit_to_extruder,
    };

    if out.insert(definition.key.clone(), entry).is_some() {
        return Err(DefinitionError::DuplicateKey(definition.key.clone()));
    }

    for child in &definition.children {
        compile_tree(child, out)?;
    }
    Ok(())
}

impl Container for DefinitionContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn as_setting_values(&self) -> Option<&dyn SupportsSettingValue> {
        Some(self)
    }

    fn as_definitions(&self) -> Option<&DefinitionContainer> {
        Some(self)
    }
}

impl SupportsSettingValue for DefinitionContainer {
    fn property(&self, key: &str, property: SettingProperty) -> Option<PropertyValue> {
        let entry = self.compiled.get(key)?;
        match property {
            SettingProperty::Value => entry.value.clone().map(PropertyValue::Value),
            SettingProperty::State => None,
            SettingProperty::Enabled => Some(PropertyValue::Enabled(entry.enabled)),
            SettingProperty::Resolve => entry.resolve.clone().map(PropertyValue::Resolve),
            SettingProperty::SettablePerExtruder => {
                Some(PropertyValue::SettablePerExtruder(entry.settable_per_extruder))
            }
            SettingProperty::LimitToExtruder => {
                Some(PropertyValue::LimitToExtruder(entry.limit_to_extruder))
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        self.compiled.keys().cloned().collect()
    }
}
