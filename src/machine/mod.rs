//! Machine topology: the global stack and its per-extruder stacks.
//!
//! The global stack holds the authoritative `machine_extruder_count`;
//! extruder stacks (0..N-1) each chain to exactly one global stack. The
//! topology is the event source for global-stack and active-extruder
//! changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use crate::settings::events::{EventSink, SettingsEvent};
use crate::settings::stack::ContainerStack;

/// Errors from topology wiring and mutation.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("no global stack is configured")]
    NoGlobalStack,

    #[error("extruder stack '{0}' is not chained to the global stack")]
    NotChainedToGlobal(String),

    #[error("extruder index {index} out of range ({count} configured)")]
    ExtruderOutOfRange { index: usize, count: usize },
}

/// The machine's stack topology.
pub struct MachineTopology {
    global: RwLock<Option<Arc<ContainerStack>>>,
    extruders: RwLock<Vec<Arc<ContainerStack>>>,
    active_extruder: AtomicUsize,
    sinks: Mutex<Vec<EventSink>>,
}

impl MachineTopology {
    /// An empty topology with no global stack yet.
    pub fn new() -> Self {
        Self {
            global: RwLock::new(None),
            extruders: RwLock::new(Vec::new()),
            active_extruder: AtomicUsize::new(0),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// A single-stack topology (no extruder stacks).
    pub fn with_global(global: Arc<ContainerStack>) -> Self {
        let topology = Self::new();
        topology.set_global_stack(global);
        topology
    }

    /// Replace the global stack. Extruder stacks chained to the previous
    /// global are discarded; the host re-registers them.
    pub fn set_global_stack(&self, stack: Arc<ContainerStack>) {
        *self.global.write().expect("topology poisoned") = Some(stack);
        self.extruders.write().expect("topology poisoned").clear();
        self.active_extruder.store(0, Ordering::SeqCst);
        self.emit(&SettingsEvent::GlobalStackChanged);
    }

    pub fn global_stack(&self) -> Option<Arc<ContainerStack>> {
        self.global.read().expect("topology poisoned").clone()
    }

    /// Register the next extruder stack; it must chain to the current
    /// global stack. Returns the extruder index.
    pub fn add_extruder_stack(&self, stack: Arc<ContainerStack>) -> Result<usize, TopologyError> {
        let global = self.global_stack().ok_or(TopologyError::NoGlobalStack)?;
        let chained = stack
            .next_stack()
            .map(|next| Arc::ptr_eq(&next, &global))
            .unwrap_or(false);
        if !chained {
            return Err(TopologyError::NotChainedToGlobal(stack.id().to_string()));
        }

        let mut extruders = self.extruders.write().expect("topology poisoned");
        extruders.push(stack);
        Ok(extruders.len() - 1)
    }

    /// The extruder stack at `index`, if configured.
    pub fn extruder_stack(&self, index: usize) -> Option<Arc<ContainerStack>> {
        self.extruders
            .read()
            .expect("topology poisoned")
            .get(index)
            .cloned()
    }

    /// Number of extruder stacks actually registered (may differ from the
    /// global `machine_extruder_count` during reconfiguration).
    pub fn configured_extruders(&self) -> usize {
        self.extruders.read().expect("topology poisoned").len()
    }

    /// The authoritative extruder count from the global stack; 1 when the
    /// setting is missing or malformed.
    pub fn machine_extruder_count(&self) -> i64 {
        let Some(global) = self.global_stack() else {
            return 1;
        };
        match global.evaluated_value("machine_extruder_count") {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(1),
            _ => 1,
        }
    }

    pub fn active_extruder(&self) -> usize {
        self.active_extruder.load(Ordering::SeqCst)
    }

    /// Change the active extruder; bounds-checked against the registered
    /// extruder stacks.
    pub fn set_active_extruder(&self, index: usize) -> Result<(), TopologyError> {
        let count = self.configured_extruders();
        if index >= count {
            return Err(TopologyError::ExtruderOutOfRange { index, count });
        }
        self.active_extruder.store(index, Ordering::SeqCst);
        self.emit(&SettingsEvent::ActiveExtruderChanged { index });
        Ok(())
    }

    /// The active extruder's stack, if extruders are configured.
    pub fn active_extruder_stack(&self) -> Option<Arc<ContainerStack>> {
        self.extruder_stack(self.active_extruder())
    }

    /// Register an event sink for topology changes.
    pub fn add_sink(&self, sink: EventSink) {
        self.sinks.lock().expect("topology sinks poisoned").push(sink);
    }

    fn emit(&self, event: &SettingsEvent) {
        let mut sinks = self.sinks.lock().expect("topology sinks poisoned");
        for sink in sinks.iter_mut() {
            sink(event);
        }
    }
}

impl Default for MachineTopology {
    fn default() -> Self {
        Self::new()
    }
}
