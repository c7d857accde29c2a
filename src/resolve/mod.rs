//! Property resolution: which stack governs a setting key.
//!
//! A `PropertyResolver` is bound to one key at a time. It picks the single
//! stack that should supply the key's displayed/edited value under the
//! multi-extruder rules, and derives two booleans for the inspector UI:
//! whether a revert-to-default affordance applies, and whether the
//! effective value is a computed fallback layered over a real override
//! (the "inherit" indicator).
//!
//! Re-running a pass with identical inputs yields identical outputs.

use std::fmt;
use std::sync::Arc;

use crate::machine::MachineTopology;
use crate::settings::container::{InstanceState, PropertyValue, SettingProperty, SettingValue};
use crate::settings::events::SettingsEvent;
use crate::settings::stack::ContainerStack;

/// A recorded, non-fatal resolution warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverWarning {
    /// The key whose resolution degraded.
    pub key: String,
    /// The extruder index the key was limited to.
    pub extruder: usize,
}

impl fmt::Display for ResolverWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "setting '{}' is limited to extruder {} but that extruder was not found",
            self.key, self.extruder
        )
    }
}

/// Resolves the governing stack for a bound setting key.
pub struct PropertyResolver {
    machine: Arc<MachineTopology>,
    key: Option<String>,
    target: Option<Arc<ContainerStack>>,
    should_show_inherit: bool,
    warnings: Vec<ResolverWarning>,
}

impl PropertyResolver {
    /// Create a resolver with no bound key.
    pub fn new(machine: Arc<MachineTopology>) -> Self {
        Self {
            machine,
            key: None,
            target: None,
            should_show_inherit: false,
            warnings: Vec::new(),
        }
    }

    /// Bind a key and run a resolution pass.
    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = Some(key.into());
        self.update_target();
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// The stack currently governing the bound key.
    pub fn target_stack(&self) -> Option<Arc<ContainerStack>> {
        self.target.clone()
    }

    /// Whether the topmost layer of the target stack supplies the value,
    /// i.e. a revert-to-default is possible.
    pub fn should_show_revert(&self) -> bool {
        let (Some(key), Some(target)) = (self.key.as_deref(), self.target.as_ref()) else {
            return false;
        };
        target.stack_levels(key).contains(&0)
    }

    /// Whether the inherit indicator should be shown.
    pub fn should_show_inherit(&self) -> bool {
        self.should_show_inherit
    }

    /// Warnings recorded by resolution passes, oldest first.
    pub fn warnings(&self) -> &[ResolverWarning] {
        &self.warnings
    }

    /// Drain the recorded warnings.
    pub fn take_warnings(&mut self) -> Vec<ResolverWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// React to a settings-model event.
    pub fn handle_event(&mut self, event: &SettingsEvent) {
        match event {
            SettingsEvent::GlobalStackChanged | SettingsEvent::ActiveExtruderChanged { .. } => {
                self.update_target();
            }
            SettingsEvent::PropertiesChanged {
                stack_id,
                key,
                properties,
            } => {
                let Some(bound) = self.key.as_deref() else {
                    return;
                };
                if key != bound {
                    return;
                }
                let from_global = self
                    .machine
                    .global_stack()
                    .map(|global| global.id() == stack_id)
                    .unwrap_or(false);
                if !from_global {
                    return;
                }
                if properties.contains(&SettingProperty::LimitToExtruder) {
                    self.update_target();
                }
                if properties.contains(&SettingProperty::Value) {
                    self.update_inherit();
                }
            }
        }
    }

    /// Run a resolution pass for the bound key.
    ///
    /// Only the single-extruder and active-extruder branches recompute the
    /// inherit indicator; the not-settable and limited-to-extruder branches
    /// leave it as is.
    pub fn update_target(&mut self) {
        let Some(key) = self.key.clone() else {
            return;
        };
        let Some(global) = self.machine.global_stack() else {
            return;
        };

        if self.machine.machine_extruder_count() <= 1 {
            // Simple case: only one extruder.
            self.target = Some(global);
            self.update_inherit();
            return;
        }

        let settable = matches!(
            global.property(&key, SettingProperty::SettablePerExtruder),
            Some(PropertyValue::SettablePerExtruder(true))
        );
        if !settable {
            // Not settable per extruder, so the global stack governs.
            self.target = Some(global);
            return;
        }

        if let Some(limit) = global.limit_to_extruder(&key) {
            match self.machine.extruder_stack(limit) {
                Some(stack) => self.target = Some(stack),
                None => {
                    log::warn!(
                        "Setting '{}' indicates it should be limited to extruder {} but that extruder was not found",
                        key,
                        limit
                    );
                    self.warnings.push(ResolverWarning {
                        key,
                        extruder: limit,
                    });
                }
            }
            return;
        }

        if let Some(stack) = self.machine.active_extruder_stack() {
            self.target = Some(stack);
        }
        self.update_inherit();
    }

    fn update_inherit(&mut self) {
        self.should_show_inherit = self.determine_inherit();
    }

    /// Decide whether the effective value is a computed fallback layered
    /// over a real override.
    ///
    /// The scan stops at the first container that carries a qualifying
    /// function; a simple "function AND literal" set test is not equivalent
    /// for all container orderings, so the walk's exact branch structure is
    /// load-bearing.
    fn determine_inherit(&self) -> bool {
        let (Some(key), Some(stack)) = (self.key.as_deref(), self.target.as_ref()) else {
            return false;
        };

        if stack.resolve_function(key).is_some() {
            return false;
        }
        if stack.state(key) != Some(InstanceState::User) {
            return false;
        }
        if !stack.enabled(key).unwrap_or(false) {
            return false;
        }

        // A function on the top layer itself is not something to inherit
        // from.
        let top_value = stack.top().and_then(|container| {
            container
                .as_setting_values()
                .and_then(|values| values.property(key, SettingProperty::Value))
        });
        if let Some(PropertyValue::Value(SettingValue::Function(_))) = top_value {
            return false;
        }

        let all_keys = stack.all_keys();
        let mut has_setting_function = false;
        let mut has_non_function_value = false;

        for container in stack.chained_containers() {
            let Some(values) = container.as_setting_values() else {
                continue;
            };
            let value = match values.property(key, SettingProperty::Value) {
                Some(PropertyValue::Value(value)) => Some(value),
                _ => None,
            };

            if let Some(value) = value {
                has_setting_function = value.is_function();
                if let SettingValue::Function(function) = &value {
                    // A function that references no real setting key won't
                    // ever change its value; treat it as a fixed value.
                    // Enum-option identifiers also show up as used keys.
                    if !function
                        .used_keys()
                        .iter()
                        .any(|used| all_keys.contains(used))
                    {
                        has_setting_function = false;
                    }
                }

                if !has_setting_function {
                    has_non_function_value = true;
                    continue;
                }
            }

            if has_setting_function {
                // There is a setting function somewhere, stop looking
                // deeper.
                break;
            }
        }

        has_setting_function && has_non_function_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::container::{InstanceContainer, InstanceState, SettingValue};
    use crate::settings::definition::DefinitionContainer;
    use crate::settings::function::SettingFunction;
    use serde_json::Value;

    const GLOBAL_DEFINITION: &str = r#"{
        "id": "fdm",
        "settings": [
            { "key": "machine_extruder_count", "default_value": 2 },
            { "key": "print_sequence", "default_value": "all_at_once" },
            { "key": "layer_height", "default_value": 0.2, "settable_per_extruder": true },
            { "key": "line_width", "value": "layer_height * 2", "settable_per_extruder": true },
            { "key": "machine_nozzle_size", "default_value": 0.4, "settable_per_extruder": false },
            {
                "key": "support_extruder_nr",
                "default_value": 0,
                "settable_per_extruder": true,
                "limit_to_extruder": 1
            },
            {
                "key": "support_missing_extruder",
                "default_value": 0,
                "settable_per_extruder": true,
                "limit_to_extruder": 5
            }
        ]
    }"#;

    fn machine(extruder_count: usize) -> Arc<MachineTopology> {
        let definition = Arc::new(DefinitionContainer::from_json_str(GLOBAL_DEFINITION).unwrap());
        let global = Arc::new(ContainerStack::new("global"));
        global.push_container(definition);
        if extruder_count != 2 {
            global.set_user_value("machine_extruder_count", Value::from(extruder_count as i64));
        }

        let topology = Arc::new(MachineTopology::with_global(global.clone()));
        for index in 0..extruder_count {
            let stack = Arc::new(ContainerStack::new(format!("extruder_{}", index)));
            ContainerStack::chain(&stack, &global);
            topology.add_extruder_stack(stack).unwrap();
        }
        topology
    }

    #[test]
    fn test_single_extruder_targets_global() {
        let machine = machine(1);
        let mut resolver = PropertyResolver::new(machine);

        // Even per-extruder and limited keys go to the global stack.
        for key in ["layer_height", "support_extruder_nr", "machine_nozzle_size"] {
            resolver.set_key(key);
            assert_eq!(resolver.target_stack().unwrap().id(), "global", "{}", key);
        }
    }

    #[test]
    fn test_not_settable_per_extruder_targets_global() {
        let machine = machine(2);
        let mut resolver = PropertyResolver::new(machine);
        resolver.set_key("machine_nozzle_size");

        assert_eq!(resolver.target_stack().unwrap().id(), "global");
    }

    #[test]
    fn test_limit_to_extruder_targets_that_extruder() {
        let machine = machine(2);
        let mut resolver = PropertyResolver::new(machine);
        resolver.set_key("support_extruder_nr");

        assert_eq!(resolver.target_stack().unwrap().id(), "extruder_1");
        assert!(resolver.warnings().is_empty());
    }

    #[test]
    fn test_missing_limited_extruder_warns_and_keeps_previous_target() {
        let machine = machine(2);
        let mut resolver = PropertyResolver::new(machine);
        resolver.set_key("layer_height");
        let previous = resolver.target_stack().unwrap().id().to_string();

        resolver.set_key("support_missing_extruder");

        assert_eq!(resolver.target_stack().unwrap().id(), previous);
        assert_eq!(
            resolver.warnings(),
            &[ResolverWarning {
                key: "support_missing_extruder".to_string(),
                extruder: 5,
            }]
        );
    }

    #[test]
    fn test_default_targets_active_extruder() {
        let machine = machine(2);
        machine.set_active_extruder(1).unwrap();
        let mut resolver = PropertyResolver::new(machine.clone());
        resolver.set_key("layer_height");
        assert_eq!(resolver.target_stack().unwrap().id(), "extruder_1");

        machine.set_active_extruder(0).unwrap();
        resolver.handle_event(&SettingsEvent::ActiveExtruderChanged { index: 0 });
        assert_eq!(resolver.target_stack().unwrap().id(), "extruder_0");
    }

    #[test]
    fn test_no_global_stack_is_a_no_op() {
        let topology = Arc::new(MachineTopology::new());
        let mut resolver = PropertyResolver::new(topology);
        resolver.set_key("layer_height");

        assert!(resolver.target_stack().is_none());
        assert!(!resolver.should_show_revert());
        assert!(!resolver.should_show_inherit());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let machine = machine(2);
        let mut resolver = PropertyResolver::new(machine);
        resolver.set_key("layer_height");

        let first = resolver.target_stack().unwrap().id().to_string();
        let first_inherit = resolver.should_show_inherit();
        resolver.update_target();
        resolver.update_target();

        assert_eq!(resolver.target_stack().unwrap().id(), first);
        assert_eq!(resolver.should_show_inherit(), first_inherit);
    }

    #[test]
    fn test_revert_shown_only_for_top_layer_override() {
        let machine = machine(1);
        let mut resolver = PropertyResolver::new(machine.clone());
        resolver.set_key("layer_height");
        assert!(!resolver.should_show_revert());

        machine
            .global_stack()
            .unwrap()
            .set_user_value("layer_height", Value::from(0.3));
        assert!(resolver.should_show_revert());
    }

    // Inherit-indicator scenarios. The target stack is an extruder stack
    // whose chain ends at the global stack; containers are layered
    // explicitly per scenario.

    fn inherit_fixture() -> (Arc<MachineTopology>, PropertyResolver) {
        let machine = machine(2);
        let resolver = PropertyResolver::new(machine.clone());
        (machine, resolver)
    }

    fn user_override(machine: &MachineTopology, extruder: usize, key: &str, value: Value) {
        machine
            .extruder_stack(extruder)
            .unwrap()
            .set_user_value(key, value);
    }

    #[test]
    fn test_inherit_false_without_user_state() {
        let (_machine, mut resolver) = inherit_fixture();
        resolver.set_key("line_width");
        // No user override anywhere: state is not User.
        assert!(!resolver.should_show_inherit());
    }

    #[test]
    fn test_inherit_true_for_user_literal_over_function() {
        let (machine, mut resolver) = inherit_fixture();
        // line_width: user literal on the extruder, function in the global
        // definition. The top layer is a literal, a deeper layer is a
        // genuine function: inherit is shown.
        user_override(&machine, 0, "line_width", Value::from(0.5));
        resolver.set_key("line_width");
        assert!(resolver.should_show_inherit());
    }

    #[test]
    fn test_inherit_false_for_literal_only() {
        let (machine, mut resolver) = inherit_fixture();
        // layer_height has only literal layers.
        user_override(&machine, 0, "layer_height", Value::from(0.3));
        resolver.set_key("layer_height");
        assert!(!resolver.should_show_inherit());
    }

    #[test]
    fn test_inherit_false_when_top_value_is_function() {
        let (machine, mut resolver) = inherit_fixture();
        // A user-entered expression: state is User, but the top layer's
        // raw value is itself a function, so there is nothing to inherit.
        machine
            .extruder_stack(0)
            .unwrap()
            .set_user_function("line_width", "layer_height * 3")
            .unwrap();
        resolver.set_key("line_width");
        assert!(!resolver.should_show_inherit());
    }

    #[test]
    fn test_inherit_false_when_function_uses_no_real_settings() {
        let (machine, mut resolver) = inherit_fixture();
        // A definition whose function only references enum-option names
        // that are not settings.
        let definition = DefinitionContainer::from_json_str(
            r#"{
                "id": "aux",
                "settings": [
                    { "key": "aux_mode", "value": "grid_option + 0", "settable_per_extruder": true }
                ]
            }"#,
        )
        .unwrap();
        machine
            .global_stack()
            .unwrap()
            .push_container(Arc::new(definition));

        user_override(&machine, 0, "aux_mode", Value::from(1));
        resolver.set_key("aux_mode");
        // The only function layer references no real setting key, so it is
        // treated as a fixed value: no inherit.
        assert!(!resolver.should_show_inherit());
    }

    #[test]
    fn test_inherit_false_when_disabled() {
        let (machine, mut resolver) = inherit_fixture();
        let definition = DefinitionContainer::from_json_str(
            r#"{
                "id": "aux",
                "settings": [
                    {
                        "key": "bridge_speed",
                        "value": "layer_height * 100",
                        "enabled": false,
                        "settable_per_extruder": true
                    }
                ]
            }"#,
        )
        .unwrap();
        machine
            .global_stack()
            .unwrap()
            .push_container(Arc::new(definition));

        user_override(&machine, 0, "bridge_speed", Value::from(30));
        resolver.set_key("bridge_speed");
        assert!(!resolver.should_show_inherit());
    }

    #[test]
    fn test_inherit_false_when_resolve_present() {
        let (machine, mut resolver) = inherit_fixture();
        let definition = DefinitionContainer::from_json_str(
            r#"{
                "id": "aux",
                "settings": [
                    {
                        "key": "material_bed_temperature",
                        "value": "layer_height * 100",
                        "resolve": "layer_height * 100",
                        "settable_per_extruder": true
                    }
                ]
            }"#,
        )
        .unwrap();
        machine
            .global_stack()
            .unwrap()
            .push_container(Arc::new(definition));

        user_override(&machine, 0, "material_bed_temperature", Value::from(60));
        resolver.set_key("material_bed_temperature");
        assert!(!resolver.should_show_inherit());
    }

    #[test]
    fn test_scan_stops_at_first_function_layer() {
        let (machine, mut resolver) = inherit_fixture();
        // Layer order on the extruder stack: user literal (top), then a
        // middle instance container with a function, then the global
        // definition with a literal below it. The scan must stop at the
        // middle function layer and still report inherit.
        let extruder = machine.extruder_stack(0).unwrap();
        let middle = InstanceContainer::new("quality_profile");
        middle.set(
            "layer_height",
            SettingValue::Function(SettingFunction::parse("machine_extruder_count / 10").unwrap()),
            InstanceState::Calculated,
        );
        extruder.push_container(Arc::new(middle));
        extruder.set_user_value("layer_height", Value::from(0.3));

        resolver.set_key("layer_height");
        assert!(resolver.should_show_inherit());
    }

    #[test]
    fn test_function_layer_followed_by_literal_still_inherits() {
        let (machine, mut resolver) = inherit_fixture();
        let extruder = machine.extruder_stack(0).unwrap();

        let quality = InstanceContainer::new("quality");
        quality.set(
            "layer_height",
            SettingValue::Function(SettingFunction::parse("machine_extruder_count / 10").unwrap()),
            InstanceState::Calculated,
        );
        let supplier = InstanceContainer::new("supplier_profile");
        supplier.set(
            "layer_height",
            SettingValue::Literal(Value::from(0.15)),
            InstanceState::Default,
        );
        extruder.push_container(Arc::new(quality));
        extruder.push_container(Arc::new(supplier));
        extruder.set_user_value("layer_height", Value::from(0.3));

        resolver.set_key("layer_height");
        // The scan stops at the quality function layer; the literal below
        // it never resets the function flag.
        assert!(resolver.should_show_inherit());
    }

    #[test]
    fn test_limit_to_extruder_change_retargets() {
        let machine = machine(2);
        let mut resolver = PropertyResolver::new(machine.clone());
        resolver.set_key("support_extruder_nr");
        assert_eq!(resolver.target_stack().unwrap().id(), "extruder_1");

        // A properties-changed event for another key is ignored.
        resolver.handle_event(&SettingsEvent::PropertiesChanged {
            stack_id: "global".to_string(),
            key: "layer_height".to_string(),
            properties: vec![SettingProperty::LimitToExtruder],
        });
        assert_eq!(resolver.target_stack().unwrap().id(), "extruder_1");

        // One for the bound key re-runs the pass.
        resolver.handle_event(&SettingsEvent::PropertiesChanged {
            stack_id: "global".to_string(),
            key: "support_extruder_nr".to_string(),
            properties: vec![SettingProperty::LimitToExtruder],
        });
        assert_eq!(resolver.target_stack().unwrap().id(), "extruder_1");
    }

    #[test]
    fn test_value_change_recomputes_inherit_only() {
        let machine = machine(2);
        let mut resolver = PropertyResolver::new(machine.clone());
        user_override(&machine, 0, "line_width", Value::from(0.5));
        resolver.set_key("line_width");
        assert!(resolver.should_show_inherit());

        // Clearing the override and signalling a value change flips the
        // indicator without retargeting.
        machine
            .extruder_stack(0)
            .unwrap()
            .remove_user_value("line_width");
        resolver.handle_event(&SettingsEvent::PropertiesChanged {
            stack_id: "global".to_string(),
            key: "line_width".to_string(),
            properties: vec![SettingProperty::Value],
        });
        assert!(!resolver.should_show_inherit());
        assert_eq!(resolver.target_stack().unwrap().id(), "extruder_0");
    }
}
