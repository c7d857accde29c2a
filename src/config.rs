//! Bridge configuration file.
//!
//! The CLI assembles its machine topology from a TOML config naming the
//! definition files and any user overrides:
//!
//! ```toml
//! [machine]
//! definition = "definitions/fdmprinter.json"
//! active_extruder = 0
//!
//! [machine.overrides]
//! layer_height = 0.15
//!
//! [[extruders]]
//! definition = "definitions/extruder.json"
//!
//! [[extruders]]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::machine::{MachineTopology, TopologyError};
use crate::settings::definition::{DefinitionContainer, DefinitionError};
use crate::settings::stack::ContainerStack;

/// Default config file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "bridge.toml";

/// Parsed bridge configuration.
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    pub machine: MachineSection,

    #[serde(default)]
    pub extruders: Vec<ExtruderSection>,
}

/// Global machine setup.
#[derive(Debug, Deserialize)]
pub struct MachineSection {
    /// Definition file for the global stack.
    pub definition: PathBuf,

    /// Active extruder index.
    #[serde(default)]
    pub active_extruder: usize,

    /// User overrides applied to the global stack.
    #[serde(default)]
    pub overrides: BTreeMap<String, toml::Value>,
}

/// Per-extruder setup.
#[derive(Debug, Deserialize, Default)]
pub struct ExtruderSection {
    /// Optional extruder-specific definition file.
    #[serde(default)]
    pub definition: Option<PathBuf>,

    /// User overrides applied to this extruder's stack.
    #[serde(default)]
    pub overrides: BTreeMap<String, toml::Value>,
}

/// Errors from loading the bridge config or building the topology.
#[derive(Debug, thiserror::Error)]
pub enum BridgeConfigError {
    #[error("I/O error reading '{path}': {message}")]
    Io { path: String, message: String },

    #[error("TOML parse error in '{path}': {message}")]
    Parse { path: String, message: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl BridgeConfig {
    /// Load a bridge config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, BridgeConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| BridgeConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| BridgeConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Build the machine topology the config describes.
    pub fn build_topology(&self) -> Result<Arc<MachineTopology>, BridgeConfigError> {
        let global = Arc::new(ContainerStack::new("global"));
        global.push_container(Arc::new(DefinitionContainer::from_file(
            &self.machine.definition,
        )?));
        apply_overrides(&global, &self.machine.overrides);

        let topology = Arc::new(MachineTopology::with_global(global.clone()));

        for (index, extruder) in self.extruders.iter().enumerate() {
            let stack = Arc::new(ContainerStack::new(format!("extruder_{}", index)));
            if let Some(definition) = &extruder.definition {
                stack.push_container(Arc::new(DefinitionContainer::from_file(definition)?));
            }
            ContainerStack::chain(&stack, &global);
            apply_overrides(&stack, &extruder.overrides);
            topology.add_extruder_stack(stack)?;
        }

        if !self.extruders.is_empty() {
            topology.set_active_extruder(self.machine.active_extruder)?;
        }
        Ok(topology)
    }
}

fn apply_overrides(stack: &ContainerStack, overrides: &BTreeMap<String, toml::Value>) {
    for (key, value) in overrides {
        stack.set_user_value(key, toml_to_json(value.clone()));
    }
}

/// Convert a TOML value to its JSON counterpart.
fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, Value> = table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect();
            Value::Object(map)
        }
    }
}
