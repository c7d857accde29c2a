//! Slicebridge Protocol Types
//!
//! Defines the wire message model exchanged with the slicing engine and the
//! JSON envelope used to frame those messages on a byte transport.

pub mod envelope;
pub mod message;

pub use envelope::{Envelope, ProtoError};
pub use message::{
    EngineMessage, ObjectList, ObjectMessage, SettingListMessage, SettingPair, SliceMessage,
};

/// Wire type name of the slice message.
pub const SLICE_MESSAGE_TYPE: &str = "slicer.proto.Slice";

/// Wire type name of the global settings message.
pub const SETTING_LIST_MESSAGE_TYPE: &str = "slicer.proto.SettingList";
