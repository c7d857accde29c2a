//! Setting containers and the capability interface for value lookup.
//!
//! A stack layers containers; only some container kinds carry per-setting
//! values. Instead of probing dynamically, containers expose an explicit
//! capability: `as_setting_values` returns `None` for containers without
//! per-setting value support, and every walk skips those silently.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::settings::function::SettingFunction;

/// Where a setting's effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// The definition default.
    Default,
    /// Computed from a setting function.
    Calculated,
    /// Explicitly set by the user.
    User,
}

/// The per-setting properties a container may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingProperty {
    Value,
    State,
    Enabled,
    Resolve,
    SettablePerExtruder,
    LimitToExtruder,
}

/// A raw setting value: a literal or a deferred expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Literal(Value),
    Function(SettingFunction),
}

impl SettingValue {
    pub fn is_function(&self) -> bool {
        matches!(self, SettingValue::Function(_))
    }
}

/// Typed payload for a property lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Value(SettingValue),
    State(InstanceState),
    Enabled(bool),
    Resolve(SettingFunction),
    SettablePerExtruder(bool),
    /// A non-negative extruder index, or `None` when not limited.
    LimitToExtruder(Option<usize>),
}

/// Base interface every stack layer implements.
pub trait Container: Send + Sync {
    /// Stable container id.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Per-setting value capability; `None` for containers that carry no
    /// setting values.
    fn as_setting_values(&self) -> Option<&dyn SupportsSettingValue> {
        None
    }

    /// Definition capability; `Some` only for definition containers.
    fn as_definitions(&self) -> Option<&crate::settings::definition::DefinitionContainer> {
        None
    }
}

/// Capability interface for containers that carry per-setting values.
pub trait SupportsSettingValue {
    /// Raw (unevaluated) property lookup.
    fn property(&self, key: &str, property: SettingProperty) -> Option<PropertyValue>;

    /// All keys this container defines any property for.
    fn keys(&self) -> Vec<String>;
}

/// One entry in an instance container.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingInstance {
    pub value: SettingValue,
    pub state: InstanceState,
}

/// A mutable layer of user or profile overrides.
///
/// Interior mutability: the stack mutates instances through `&self` while
/// readers on other threads look values up concurrently. All mutation goes
/// through the owning stack so caches and notifications stay coherent.
pub struct InstanceContainer {
    id: String,
    name: String,
    instances: RwLock<BTreeMap<String, SettingInstance>>,
}

impl InstanceContainer {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set a literal value with the given state.
    pub fn set(&self, key: impl Into<String>, value: SettingValue, state: InstanceState) {
        self.instances
            .write()
            .expect("instance container poisoned")
            .insert(key.into(), SettingInstance { value, state });
    }

    /// Set a user-state literal value.
    pub fn set_user_literal(&self, key: impl Into<String>, value: Value) {
        self.set(key, SettingValue::Literal(value), InstanceState::User);
    }

    /// Remove an entry; returns true if it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.instances
            .write()
            .expect("instance container poisoned")
            .remove(key)
            .is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.instances
            .read()
            .expect("instance container poisoned")
            .is_empty()
    }
}

impl Container for InstanceContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn as_setting_values(&self) -> Option<&dyn SupportsSettingValue> {
        Some(self)
    }
}

impl SupportsSettingValue for InstanceContainer {
    fn property(&self, key: &str, property: SettingProperty) -> Option<PropertyValue> {
        let instances = self.instances.read().expect("instance container poisoned");
        let instance = instances.get(key)?;
        match property {
            SettingProperty::Value => Some(PropertyValue::Value(instance.value.clone())),
            SettingProperty::State => Some(PropertyValue::State(instance.state)),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<String> {
        self.instances
            .read()
            .expect("instance container poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// An id/name/metadata-only container with no setting values.
///
/// Stacks carry one of these for machine metadata; every setting walk
/// skips it via the missing capability.
pub struct MetadataContainer {
    id: String,
    name: String,
    metadata: BTreeMap<String, String>,
}

impl MetadataContainer {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl Container for MetadataContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Stringify a literal the way the engine expects it.
///
/// Strings are passed through unquoted; everything else uses its JSON
/// rendering ("true", "0.2", ...).
pub fn literal_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
