//! Change notifications for stacks and machine topology.
//!
//! The settings model is the event source; UI-facing consumers such as the
//! property resolver register sinks and react. There is no global event bus:
//! sinks are registered directly on the stack or topology that emits.

use std::sync::{Arc, Mutex};

use crate::settings::container::SettingProperty;

/// Events emitted by the settings model.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEvent {
    /// One or more properties of a setting changed on a stack.
    PropertiesChanged {
        /// Id of the stack that changed.
        stack_id: String,
        /// The setting key whose properties changed.
        key: String,
        /// Which properties changed.
        properties: Vec<SettingProperty>,
    },

    /// The machine's global stack was replaced.
    GlobalStackChanged,

    /// The active extruder changed.
    ActiveExtruderChanged {
        /// New active extruder index.
        index: usize,
    },
}

/// Callback type for receiving settings events.
pub type EventSink = Box<dyn FnMut(&SettingsEvent) + Send>;

/// Simple event collector for testing.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<SettingsEvent>>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that appends every event to this collector.
    pub fn sink(&self) -> EventSink {
        let events = Arc::clone(&self.events);
        Box::new(move |event| {
            events.lock().expect("event collector poisoned").push(event.clone());
        })
    }

    /// Snapshot of the collected events.
    pub fn events(&self) -> Vec<SettingsEvent> {
        self.events.lock().expect("event collector poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event collector poisoned").clear();
    }
}
