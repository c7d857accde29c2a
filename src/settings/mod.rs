//! Setting model: containers, definition trees, functions, and stacks.

pub mod container;
pub mod definition;
pub mod events;
pub mod function;
pub mod stack;

pub use container::{
    Container, InstanceContainer, InstanceState, MetadataContainer, PropertyValue,
    SettingProperty, SettingValue, SupportsSettingValue,
};
pub use definition::{DefinitionContainer, DefinitionError, DefinitionSource, SettingDefinition};
pub use events::{EventCollector, EventSink, SettingsEvent};
pub use function::{FunctionError, SettingFunction, SettingLookup};
pub use stack::ContainerStack;
