//! Slicebridge - settings resolution and engine payload bridge
//!
//! This crate implements the configuration-resolution core of a slicer
//! frontend: layered setting stacks with multi-extruder resolution rules,
//! and the background job that flattens the resolved settings plus the
//! scene into wire messages for the external slicing engine.

pub mod config;
pub mod job;
pub mod machine;
pub mod resolve;
pub mod scene;
pub mod settings;
pub mod transport;

pub use config::BridgeConfig;
pub use job::{SliceJob, SliceJobOutcome, SliceJobReport};
pub use machine::MachineTopology;
pub use resolve::PropertyResolver;
pub use settings::ContainerStack;
pub use transport::{MessageSink, RecordingSink};
