//! Engine message types.
//!
//! The engine consumes two message kinds: a `SettingList` carrying the
//! resolved global settings, sent once before slicing, and a `Slice`
//! carrying object groups with per-object vertex buffers and overrides.
//! Every setting value travels as UTF-8 bytes, even numeric and boolean
//! ones; the engine parses them on its side.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::envelope::base64_bytes;
use crate::{SETTING_LIST_MESSAGE_TYPE, SLICE_MESSAGE_TYPE};

/// A single name/value settings entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingPair {
    /// Setting key.
    pub name: String,

    /// Setting value as UTF-8 bytes.
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl SettingPair {
    /// Create a pair from a key and a textual value.
    pub fn new(name: impl Into<String>, value: impl AsRef<str>) -> Self {
        Self {
            name: name.into(),
            value: value.as_ref().as_bytes().to_vec(),
        }
    }

    /// The value decoded as UTF-8.
    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// One printable object: id, vertex buffer, per-object overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObjectMessage {
    /// Stable object identifier, unique within the scene.
    pub id: u64,

    /// Vertex buffer in engine space, interleaved x,y,z triples.
    pub vertices: Vec<f32>,

    /// Flattened per-object setting overrides.
    pub settings: Vec<SettingPair>,
}

impl ObjectMessage {
    /// Append one vertex to the buffer.
    pub fn push_vertex(&mut self, x: f32, y: f32, z: f32) {
        self.vertices.extend_from_slice(&[x, y, z]);
    }

    /// Number of vertices in the buffer.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }
}

/// One group of objects that print together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObjectList {
    /// Objects in the group, in print order.
    pub objects: Vec<ObjectMessage>,
}

impl ObjectList {
    /// Append an empty object entry and return it for filling in.
    pub fn add_object(&mut self) -> &mut ObjectMessage {
        self.objects.push(ObjectMessage::default());
        self.objects.last_mut().expect("just pushed")
    }
}

/// The slice request payload: object groups in print order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SliceMessage {
    /// Object groups; one per print-order constraint.
    pub object_lists: Vec<ObjectList>,
}

impl SliceMessage {
    /// Append an empty group and return it for filling in.
    pub fn add_object_list(&mut self) -> &mut ObjectList {
        self.object_lists.push(ObjectList::default());
        self.object_lists.last_mut().expect("just pushed")
    }

    /// Total object count across all groups.
    pub fn object_count(&self) -> usize {
        self.object_lists.iter().map(|l| l.objects.len()).sum()
    }
}

/// The global settings payload, sent before the slice message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SettingListMessage {
    /// All resolved global settings as name/value pairs.
    pub settings: Vec<SettingPair>,
}

impl SettingListMessage {
    /// Look up a setting value by name (first match).
    pub fn get(&self, name: &str) -> Option<Cow<'_, str>> {
        self.settings
            .iter()
            .find(|pair| pair.name == name)
            .map(SettingPair::value_str)
    }
}

/// Any outgoing engine message.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// Global settings, sent once per job before the slice message.
    SettingList(SettingListMessage),
    /// The slice request itself.
    Slice(SliceMessage),
}

impl EngineMessage {
    /// Wire type name of this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            EngineMessage::SettingList(_) => SETTING_LIST_MESSAGE_TYPE,
            EngineMessage::Slice(_) => SLICE_MESSAGE_TYPE,
        }
    }
}
