//! Container stacks: layered key/value resolution with an inheritance chain.
//!
//! A stack is an ordered list of containers (index 0 is the top, highest
//! priority) plus an optional next stack forming a singly-linked chain that
//! terminates at the global stack. Property lookups walk own containers
//! first, then delegate down the chain. Resolved lookups are cached per
//! (key, property) and invalidated on every mutation, including mutations
//! of any stack further down the chain.
//!
//! Mutation is expected from the interactive thread only; readers on other
//! threads see a coherent snapshot through the interior locks.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use crate::settings::container::{
    literal_to_string, Container, InstanceContainer, InstanceState, PropertyValue,
    SettingProperty, SettingValue,
};
use crate::settings::events::{EventSink, SettingsEvent};
use crate::settings::function::{SettingFunction, SettingLookup};

type PropertyCache = Arc<Mutex<HashMap<(String, SettingProperty), Option<PropertyValue>>>>;

/// A layered configuration stack.
pub struct ContainerStack {
    id: String,
    user: Arc<InstanceContainer>,
    containers: RwLock<Vec<Arc<dyn Container>>>,
    next_stack: RwLock<Option<Arc<ContainerStack>>>,
    cache: PropertyCache,
    sinks: Mutex<Vec<EventSink>>,
}

impl ContainerStack {
    /// Create a stack with an empty user container on top.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let user = Arc::new(InstanceContainer::new(format!("{}_user", id)));
        let containers: Vec<Arc<dyn Container>> = vec![user.clone()];
        Self {
            id,
            user,
            containers: RwLock::new(containers),
            next_stack: RwLock::new(None),
            cache: Arc::new(Mutex::new(HashMap::new())),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a container below the existing ones (lower priority).
    pub fn push_container(&self, container: Arc<dyn Container>) {
        self.containers
            .write()
            .expect("stack containers poisoned")
            .push(container);
        self.invalidate_cache();
    }

    /// Containers in priority order (index 0 = top).
    pub fn containers(&self) -> Vec<Arc<dyn Container>> {
        self.containers
            .read()
            .expect("stack containers poisoned")
            .clone()
    }

    /// The top (highest priority) container.
    pub fn top(&self) -> Option<Arc<dyn Container>> {
        self.containers
            .read()
            .expect("stack containers poisoned")
            .first()
            .cloned()
    }

    /// The parent stack, if chained.
    pub fn next_stack(&self) -> Option<Arc<ContainerStack>> {
        self.next_stack
            .read()
            .expect("stack chain poisoned")
            .clone()
    }

    /// Chain `child` to `parent`.
    ///
    /// The child's cache may hold values resolved through the parent, so a
    /// cache-clearing sink is registered on the parent.
    pub fn chain(child: &Arc<ContainerStack>, parent: &Arc<ContainerStack>) {
        *child.next_stack.write().expect("stack chain poisoned") = Some(parent.clone());
        child.invalidate_cache();

        let cache = Arc::clone(&child.cache);
        parent.add_sink(Box::new(move |_event| {
            cache.lock().expect("stack cache poisoned").clear();
        }));
    }

    /// Register an event sink. Sinks must not mutate the stack.
    pub fn add_sink(&self, sink: EventSink) {
        self.sinks.lock().expect("stack sinks poisoned").push(sink);
    }

    fn emit(&self, event: &SettingsEvent) {
        let mut sinks = self.sinks.lock().expect("stack sinks poisoned");
        for sink in sinks.iter_mut() {
            sink(event);
        }
    }

    fn invalidate_cache(&self) {
        self.cache.lock().expect("stack cache poisoned").clear();
    }

    /// Resolve a property: own containers top-down, else the next stack.
    pub fn property(&self, key: &str, property: SettingProperty) -> Option<PropertyValue> {
        let cache_key = (key.to_string(), property);
        if let Some(cached) = self
            .cache
            .lock()
            .expect("stack cache poisoned")
            .get(&cache_key)
        {
            return cached.clone();
        }

        let mut resolved = None;
        for container in self.containers() {
            let Some(values) = container.as_setting_values() else {
                continue;
            };
            if let Some(value) = values.property(key, property) {
                resolved = Some(value);
                break;
            }
        }
        if resolved.is_none() {
            if let Some(next) = self.next_stack() {
                resolved = next.property(key, property);
            }
        }

        self.cache
            .lock()
            .expect("stack cache poisoned")
            .insert(cache_key, resolved.clone());
        resolved
    }

    /// The raw (unevaluated) value for a key.
    pub fn raw_value(&self, key: &str) -> Option<SettingValue> {
        match self.property(key, SettingProperty::Value) {
            Some(PropertyValue::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// The effective value for a key; functions are evaluated against
    /// this stack. Evaluation failures degrade to a warning and `None`.
    pub fn evaluated_value(&self, key: &str) -> Option<Value> {
        match self.raw_value(key)? {
            SettingValue::Literal(value) => Some(value),
            SettingValue::Function(function) => match function.evaluate(self) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!(
                        "Failed to evaluate function for setting '{}' on stack '{}': {}",
                        key,
                        self.id,
                        e
                    );
                    None
                }
            },
        }
    }

    /// The effective value stringified for the wire.
    pub fn value_str(&self, key: &str) -> Option<String> {
        self.evaluated_value(key).map(|v| literal_to_string(&v))
    }

    pub fn state(&self, key: &str) -> Option<InstanceState> {
        match self.property(key, SettingProperty::State) {
            Some(PropertyValue::State(state)) => Some(state),
            _ => None,
        }
    }

    pub fn enabled(&self, key: &str) -> Option<bool> {
        match self.property(key, SettingProperty::Enabled) {
            Some(PropertyValue::Enabled(enabled)) => Some(enabled),
            _ => None,
        }
    }

    pub fn settable_per_extruder(&self, key: &str) -> Option<bool> {
        match self.property(key, SettingProperty::SettablePerExtruder) {
            Some(PropertyValue::SettablePerExtruder(settable)) => Some(settable),
            _ => None,
        }
    }

    /// The extruder index the key is pinned to, if any.
    pub fn limit_to_extruder(&self, key: &str) -> Option<usize> {
        match self.property(key, SettingProperty::LimitToExtruder) {
            Some(PropertyValue::LimitToExtruder(limit)) => limit,
            _ => None,
        }
    }

    pub fn resolve_function(&self, key: &str) -> Option<SettingFunction> {
        match self.property(key, SettingProperty::Resolve) {
            Some(PropertyValue::Resolve(function)) => Some(function),
            _ => None,
        }
    }

    /// Containers of this stack and every ancestor, in priority order.
    pub fn chained_containers(&self) -> Vec<Arc<dyn Container>> {
        let mut containers = self.containers();
        let mut cursor = self.next_stack();
        while let Some(stack) = cursor {
            containers.extend(stack.containers());
            cursor = stack.next_stack();
        }
        containers
    }

    /// Every key known anywhere along the chain.
    pub fn all_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for container in self.chained_containers() {
            if let Some(values) = container.as_setting_values() {
                keys.extend(values.keys());
            }
        }
        keys
    }

    /// Flattened indices (across the chain) of containers defining a raw
    /// value for the key.
    pub fn stack_levels(&self, key: &str) -> Vec<usize> {
        let mut levels = Vec::new();
        for (index, container) in self.chained_containers().iter().enumerate() {
            if let Some(values) = container.as_setting_values() {
                if matches!(
                    values.property(key, SettingProperty::Value),
                    Some(PropertyValue::Value(_))
                ) {
                    levels.push(index);
                }
            }
        }
        levels
    }

    /// Set a user-state literal on the top container.
    pub fn set_user_value(&self, key: &str, value: Value) {
        self.user.set_user_literal(key, value);
        self.invalidate_cache();
        self.emit(&SettingsEvent::PropertiesChanged {
            stack_id: self.id.clone(),
            key: key.to_string(),
            properties: vec![SettingProperty::Value, SettingProperty::State],
        });
    }

    /// Set a user-entered expression on the top container.
    pub fn set_user_function(
        &self,
        key: &str,
        source: &str,
    ) -> Result<(), crate::settings::function::FunctionError> {
        let function = SettingFunction::parse(source)?;
        self.user
            .set(key, SettingValue::Function(function), InstanceState::User);
        self.invalidate_cache();
        self.emit(&SettingsEvent::PropertiesChanged {
            stack_id: self.id.clone(),
            key: key.to_string(),
            properties: vec![SettingProperty::Value, SettingProperty::State],
        });
        Ok(())
    }

    /// Set a calculated function on the top container.
    pub fn set_calculated_function(
        &self,
        key: &str,
        source: &str,
    ) -> Result<(), crate::settings::function::FunctionError> {
        let function = SettingFunction::parse(source)?;
        self.user.set(
            key,
            SettingValue::Function(function),
            InstanceState::Calculated,
        );
        self.invalidate_cache();
        self.emit(&SettingsEvent::PropertiesChanged {
            stack_id: self.id.clone(),
            key: key.to_string(),
            properties: vec![SettingProperty::Value, SettingProperty::State],
        });
        Ok(())
    }

    /// Remove the user override for a key, reverting to lower layers.
    pub fn remove_user_value(&self, key: &str) {
        if self.user.remove(key) {
            self.invalidate_cache();
            self.emit(&SettingsEvent::PropertiesChanged {
                stack_id: self.id.clone(),
                key: key.to_string(),
                properties: vec![SettingProperty::Value, SettingProperty::State],
            });
        }
    }

    /// Signal that properties of a key changed outside the stack's own
    /// mutators (e.g. a dependency of a definition function). Invalidates
    /// the cache and notifies sinks.
    pub fn notify_properties_changed(&self, key: &str, properties: Vec<SettingProperty>) {
        self.invalidate_cache();
        self.emit(&SettingsEvent::PropertiesChanged {
            stack_id: self.id.clone(),
            key: key.to_string(),
            properties,
        });
    }
}

impl SettingLookup for ContainerStack {
    fn setting_value(&self, key: &str) -> Option<Value> {
        self.evaluated_value(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::container::MetadataContainer;
    use crate::settings::definition::DefinitionContainer;
    use crate::settings::events::EventCollector;

    fn machine_definition() -> Arc<DefinitionContainer> {
        Arc::new(
            DefinitionContainer::from_json_str(
                r#"{
                    "id": "fdm",
                    "settings": [
                        { "key": "machine_extruder_count", "default_value": 1 },
                        { "key": "layer_height", "default_value": 0.2, "settable_per_extruder": true },
                        { "key": "line_width", "value": "layer_height * 2", "settable_per_extruder": true }
                    ]
                }"#,
            )
            .unwrap(),
        )
    }

    fn global_stack() -> Arc<ContainerStack> {
        let stack = Arc::new(ContainerStack::new("global"));
        stack.push_container(machine_definition());
        stack
    }

    #[test]
    fn test_top_container_wins() {
        let stack = global_stack();
        stack.set_user_value("layer_height", Value::from(0.3));

        assert_eq!(stack.evaluated_value("layer_height"), Some(Value::from(0.3)));
        assert_eq!(stack.state("layer_height"), Some(InstanceState::User));
    }

    #[test]
    fn test_definition_default_when_no_override() {
        let stack = global_stack();
        assert_eq!(stack.evaluated_value("layer_height"), Some(Value::from(0.2)));
        assert_eq!(stack.state("layer_height"), None);
    }

    #[test]
    fn test_unknown_key_resolves_to_none() {
        let stack = global_stack();
        assert_eq!(stack.property("bogus", SettingProperty::Value), None);
        assert_eq!(stack.evaluated_value("bogus"), None);
    }

    #[test]
    fn test_delegation_to_next_stack() {
        let global = global_stack();
        let extruder = Arc::new(ContainerStack::new("extruder_0"));
        ContainerStack::chain(&extruder, &global);

        assert_eq!(
            extruder.evaluated_value("layer_height"),
            Some(Value::from(0.2))
        );
    }

    #[test]
    fn test_function_evaluates_against_querying_stack() {
        let global = global_stack();
        let extruder = Arc::new(ContainerStack::new("extruder_0"));
        ContainerStack::chain(&extruder, &global);

        extruder.set_user_value("layer_height", Value::from(0.1));

        // line_width is defined once on the global definition, but the
        // extruder's own layer_height feeds the evaluation.
        assert_eq!(extruder.evaluated_value("line_width"), Some(Value::from(0.2)));
        assert_eq!(global.evaluated_value("line_width"), Some(Value::from(0.4)));
    }

    #[test]
    fn test_cache_invalidated_on_set() {
        let stack = global_stack();
        assert_eq!(stack.evaluated_value("layer_height"), Some(Value::from(0.2)));

        stack.set_user_value("layer_height", Value::from(0.15));
        assert_eq!(
            stack.evaluated_value("layer_height"),
            Some(Value::from(0.15))
        );

        stack.remove_user_value("layer_height");
        assert_eq!(stack.evaluated_value("layer_height"), Some(Value::from(0.2)));
    }

    #[test]
    fn test_parent_mutation_invalidates_child_cache() {
        let global = global_stack();
        let extruder = Arc::new(ContainerStack::new("extruder_0"));
        ContainerStack::chain(&extruder, &global);

        // Prime the child cache through delegation.
        assert_eq!(
            extruder.evaluated_value("layer_height"),
            Some(Value::from(0.2))
        );

        global.set_user_value("layer_height", Value::from(0.25));
        assert_eq!(
            extruder.evaluated_value("layer_height"),
            Some(Value::from(0.25))
        );
    }

    #[test]
    fn test_stack_levels_flattened_across_chain() {
        let global = global_stack();
        let extruder = Arc::new(ContainerStack::new("extruder_0"));
        ContainerStack::chain(&extruder, &global);

        // Only the global definition defines layer_height: the extruder
        // contributes 1 container (user) before the global's 2.
        assert_eq!(extruder.stack_levels("layer_height"), vec![2]);

        extruder.set_user_value("layer_height", Value::from(0.1));
        assert_eq!(extruder.stack_levels("layer_height"), vec![0, 2]);
    }

    #[test]
    fn test_all_keys_across_chain() {
        let global = global_stack();
        let extruder = Arc::new(ContainerStack::new("extruder_0"));
        ContainerStack::chain(&extruder, &global);
        extruder.set_user_value("retraction_amount", Value::from(6.5));

        let keys = extruder.all_keys();
        assert!(keys.contains("layer_height"));
        assert!(keys.contains("retraction_amount"));
        assert!(keys.contains("machine_extruder_count"));
    }

    #[test]
    fn test_metadata_container_skipped() {
        let stack = global_stack();
        stack.push_container(Arc::new(
            MetadataContainer::new("meta").with_entry("vendor", "acme"),
        ));

        // Lookup still resolves through the definition container.
        assert_eq!(stack.evaluated_value("layer_height"), Some(Value::from(0.2)));
    }

    #[test]
    fn test_set_emits_properties_changed() {
        let stack = global_stack();
        let collector = EventCollector::new();
        stack.add_sink(collector.sink());

        stack.set_user_value("layer_height", Value::from(0.3));

        let events = collector.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            SettingsEvent::PropertiesChanged {
                stack_id: "global".to_string(),
                key: "layer_height".to_string(),
                properties: vec![SettingProperty::Value, SettingProperty::State],
            }
        );
    }

    #[test]
    fn test_remove_without_override_is_silent() {
        let stack = global_stack();
        let collector = EventCollector::new();
        stack.add_sink(collector.sink());

        stack.remove_user_value("layer_height");
        assert!(collector.events().is_empty());
    }

    #[test]
    fn test_calculated_function_state() {
        let stack = global_stack();
        stack
            .set_calculated_function("layer_height", "machine_extruder_count / 10")
            .unwrap();

        assert_eq!(stack.state("layer_height"), Some(InstanceState::Calculated));
        assert_eq!(
            stack.evaluated_value("layer_height"),
            Some(Value::from(0.1))
        );
    }
}
