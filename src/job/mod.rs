//! Slice job: flatten settings and scene into engine messages.
//!
//! A `SliceJob` is built fresh per slice request. It snapshots the scene's
//! printable objects under the scene lock, resolves every global setting
//! through the global stack, and transmits a `SettingList` message followed
//! by a `Slice` message. A scene with nothing to slice completes as a
//! successful no-op; nothing in here is fatal to the host.

pub mod gcode;
pub mod worker;

pub use gcode::{GcodeFormatter, GcodeWarning};
pub use worker::{spawn, CancellationToken, JobContext, JobHandle};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use slicebridge_proto::{EngineMessage, SettingListMessage, SettingPair, SliceMessage};

use crate::machine::MachineTopology;
use crate::scene::math::{Matrix4, Vector3};
use crate::scene::{MeshData, PrintOrder, Scene, SceneNode};
use crate::settings::stack::ContainerStack;
use crate::transport::{MessageSink, TransportError};

/// Print sequence setting key.
pub const PRINT_SEQUENCE_KEY: &str = "print_sequence";

/// Print sequence value requesting one object at a time.
pub const ONE_AT_A_TIME: &str = "one_at_a_time";

const START_GCODE_KEY: &str = "machine_start_gcode";
const END_GCODE_KEY: &str = "machine_end_gcode";
const BED_TEMP_TOKEN: &str = "{material_bed_temperature}";
const PRINT_TEMP_TOKEN: &str = "{material_print_temperature}";
const BED_TEMP_PREPEND_KEY: &str = "material_bed_temp_prepend";
const PRINT_TEMP_PREPEND_KEY: &str = "material_print_temp_prepend";

/// Errors from job setup and transmission.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no global stack is configured")]
    NoGlobalStack,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// How a slice job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceJobOutcome {
    /// Messages were transmitted to the engine.
    Sent {
        group_count: usize,
        object_count: usize,
        settings_sent: usize,
    },
    /// No printable objects were found; nothing was transmitted.
    NothingToSlice,
    /// The job was cancelled at a checkpoint; nothing further was sent.
    Cancelled,
}

/// Report of one slice job run.
#[derive(Debug, Clone)]
pub struct SliceJobReport {
    /// Identifier of this run.
    pub job_id: String,

    pub outcome: SliceJobOutcome,

    /// SHA-256 over the canonicalized payload; present only when sent.
    pub payload_fingerprint: Option<String>,

    /// G-code expansion warnings recorded during serialization.
    pub gcode_warnings: Vec<GcodeWarning>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of one printable object, taken under the scene lock.
struct ObjectSnapshot {
    id: u64,
    mesh: Arc<MeshData>,
    transform: Matrix4,
    profile: Vec<(String, String)>,
    settings: Vec<(String, String)>,
}

impl ObjectSnapshot {
    fn capture(node: &SceneNode) -> Option<Self> {
        let mesh = node.mesh()?.clone();
        Some(Self {
            id: node.id(),
            mesh,
            transform: *node.world_transform(),
            profile: node.profile().to_vec(),
            settings: node.per_object_settings().to_vec(),
        })
    }
}

/// One print group with the profile of its enclosing group node, if any.
struct GroupSnapshot {
    group_profile: Vec<(String, String)>,
    objects: Vec<ObjectSnapshot>,
}

/// Sends the current scene and settings to the engine.
pub struct SliceJob {
    scene: Arc<Scene>,
    machine: Arc<MachineTopology>,
    order: Box<dyn PrintOrder>,
    sink: Arc<dyn MessageSink>,
}

impl SliceJob {
    pub fn new(
        scene: Arc<Scene>,
        machine: Arc<MachineTopology>,
        order: Box<dyn PrintOrder>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            scene,
            machine,
            order,
            sink,
        }
    }

    /// Run the job to completion (or cancellation).
    pub fn run(&self, context: &JobContext) -> Result<SliceJobReport, JobError> {
        let job_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut formatter = GcodeFormatter::new();

        let finish = |outcome: SliceJobOutcome,
                      fingerprint: Option<String>,
                      formatter: &mut GcodeFormatter| SliceJobReport {
            job_id: job_id.clone(),
            outcome,
            payload_fingerprint: fingerprint,
            gcode_warnings: formatter.take_warnings(),
            started_at,
            finished_at: Utc::now(),
        };

        let global = self.machine.global_stack().ok_or(JobError::NoGlobalStack)?;
        let one_at_a_time =
            global.value_str(PRINT_SEQUENCE_KEY).as_deref() == Some(ONE_AT_A_TIME);

        // Phase 1: snapshot groups under the scene lock; the lock is
        // released before any serialization or transport work.
        let groups = {
            let mut tree = self.scene.lock();
            tree.purge_layer_data();
            if one_at_a_time {
                self.collect_one_at_a_time(&tree, context)
            } else {
                self.collect_all_at_once(&tree, context)
            }
        };

        let Some(groups) = groups else {
            return Ok(finish(SliceJobOutcome::Cancelled, None, &mut formatter));
        };

        if groups.is_empty() {
            if one_at_a_time {
                log::warn!("No objects suitable for one at a time found, or no correct order found");
            } else {
                log::warn!("No printable objects found, nothing to slice");
            }
            return Ok(finish(SliceJobOutcome::NothingToSlice, None, &mut formatter));
        }

        // Phase 2: resolve and transmit the global settings.
        let mut settings = collect_global_settings(&global);
        let start_gcode = settings.get(START_GCODE_KEY).cloned().unwrap_or_default();
        settings.insert(
            BED_TEMP_PREPEND_KEY.to_string(),
            (!start_gcode.contains(BED_TEMP_TOKEN)).to_string(),
        );
        settings.insert(
            PRINT_TEMP_PREPEND_KEY.to_string(),
            (!start_gcode.contains(PRINT_TEMP_TOKEN)).to_string(),
        );

        let mut setting_list = SettingListMessage::default();
        for (key, value) in &settings {
            if !context.checkpoint() {
                return Ok(finish(SliceJobOutcome::Cancelled, None, &mut formatter));
            }
            let value = if key == START_GCODE_KEY || key == END_GCODE_KEY {
                formatter.expand(value, &settings)
            } else {
                value.clone()
            };
            setting_list.settings.push(SettingPair::new(key, &value));
        }
        let settings_sent = setting_list.settings.len();
        self.sink
            .send(EngineMessage::SettingList(setting_list.clone()))?;

        // Phase 3: compose and transmit the slice message.
        let mut slice = SliceMessage::default();
        for group in &groups {
            let list = slice.add_object_list();
            for (index, object) in group.objects.iter().enumerate() {
                if !context.checkpoint() {
                    return Ok(finish(SliceJobOutcome::Cancelled, None, &mut formatter));
                }

                let entry = list.add_object();
                entry.id = object.id;
                for vertex in &object.mesh.vertices {
                    let world = object.transform.transform_point(*vertex);
                    let engine = to_engine_space(world);
                    entry.push_vertex(engine.x, engine.y, engine.z);
                }

                let mut sources: Vec<&[(String, String)]> = Vec::new();
                if index == 0 {
                    sources.push(&group.group_profile);
                }
                sources.push(&object.profile);
                sources.push(&object.settings);
                for (name, value) in flatten_pairs(&sources) {
                    if !context.checkpoint() {
                        return Ok(finish(SliceJobOutcome::Cancelled, None, &mut formatter));
                    }
                    entry.settings.push(SettingPair::new(name, &value));
                }
            }
        }

        let group_count = slice.object_lists.len();
        let object_count = slice.object_count();
        let fingerprint = payload_fingerprint(&setting_list, &slice);

        log::debug!("Sending data to engine for slicing");
        self.sink.send(EngineMessage::Slice(slice))?;
        log::debug!("Sending data to engine is completed");

        Ok(finish(
            SliceJobOutcome::Sent {
                group_count,
                object_count,
                settings_sent,
            },
            fingerprint,
            &mut formatter,
        ))
    }

    /// One group per ordered top-level object; descendants print with
    /// their top-level object. Returns `None` on cancellation.
    fn collect_one_at_a_time(
        &self,
        tree: &crate::scene::SceneTree,
        context: &JobContext,
    ) -> Option<Vec<GroupSnapshot>> {
        let Some(order) = self.order.order(tree) else {
            return Some(Vec::new());
        };

        let mut groups = Vec::new();
        for id in order {
            if !context.checkpoint() {
                return None;
            }
            let Some(node) = tree.root().children().iter().find(|n| n.id() == id) else {
                continue;
            };
            if node.is_outside_build_area() {
                continue;
            }

            let group = collect_group(node);
            if !group.objects.is_empty() {
                groups.push(group);
            }
        }
        Some(groups)
    }

    /// All qualifying objects in scene traversal order form one group.
    /// Returns `None` on cancellation.
    fn collect_all_at_once(
        &self,
        tree: &crate::scene::SceneTree,
        context: &JobContext,
    ) -> Option<Vec<GroupSnapshot>> {
        let mut objects = Vec::new();
        let mut group_profile: Vec<(String, String)> = Vec::new();

        // Pre-order walk with parent tracking for the group decoration of
        // the first collected object.
        let mut stack: Vec<(&SceneNode, Option<&SceneNode>)> = vec![(tree.root(), None)];
        while let Some((node, parent)) = stack.pop() {
            if !context.checkpoint() {
                return None;
            }
            if node.has_printable_mesh() && !node.is_group() && !node.is_outside_build_area() {
                if objects.is_empty() {
                    if let Some(parent) = parent {
                        if parent.is_group() {
                            group_profile = parent.profile().to_vec();
                        }
                    }
                }
                if let Some(snapshot) = ObjectSnapshot::capture(node) {
                    objects.push(snapshot);
                }
            }
            for child in node.children().iter().rev() {
                stack.push((child, Some(node)));
            }
        }

        if objects.is_empty() {
            Some(Vec::new())
        } else {
            Some(vec![GroupSnapshot {
                group_profile,
                objects,
            }])
        }
    }
}

/// Collect one print group from a top-level node: mesh-bearing descendants
/// first, then the node itself.
fn collect_group(top: &SceneNode) -> GroupSnapshot {
    fn descendants<'a>(
        node: &'a SceneNode,
        out: &mut Vec<(&'a SceneNode, &'a SceneNode)>,
    ) {
        for child in node.children() {
            out.push((child, node));
            descendants(child, out);
        }
    }

    let mut candidates: Vec<(&SceneNode, Option<&SceneNode>)> = Vec::new();
    let mut nested = Vec::new();
    descendants(top, &mut nested);
    for (node, parent) in nested {
        candidates.push((node, Some(parent)));
    }
    candidates.push((top, None));

    let mut group_profile: Vec<(String, String)> = Vec::new();
    let mut objects = Vec::new();
    for (node, parent) in candidates {
        if !node.has_printable_mesh() || node.is_group() {
            continue;
        }
        if objects.is_empty() {
            let enclosing = parent.unwrap_or(top);
            if enclosing.is_group() {
                group_profile = enclosing.profile().to_vec();
            }
        }
        if let Some(snapshot) = ObjectSnapshot::capture(node) {
            objects.push(snapshot);
        }
    }

    GroupSnapshot {
        group_profile,
        objects,
    }
}

/// Resolve the current value of every key reachable from the global
/// stack's definition containers. Child definition values override their
/// parents on duplicate keys.
pub fn collect_global_settings(stack: &ContainerStack) -> BTreeMap<String, String> {
    fn collect(
        stack: &ContainerStack,
        definition: &crate::settings::definition::SettingDefinition,
        out: &mut BTreeMap<String, String>,
    ) {
        out.insert(
            definition.key.clone(),
            stack.value_str(&definition.key).unwrap_or_default(),
        );
        for child in &definition.children {
            collect(stack, child, out);
        }
    }

    let mut values = BTreeMap::new();
    for container in stack.containers() {
        let Some(definitions) = container.as_definitions() else {
            continue;
        };
        for definition in definitions.definitions() {
            collect(stack, definition, &mut values);
        }
    }
    values
}

/// Map a model-space point into engine space.
///
/// The engine's coordinate system swaps the y and z axes and inverts the
/// resulting y, relative to model space.
pub fn to_engine_space(point: Vector3) -> Vector3 {
    Vector3::new(point.x, point.z, -point.y)
}

/// Flatten override sources in order; later duplicate keys overwrite the
/// value recorded at the first occurrence.
fn flatten_pairs(sources: &[&[(String, String)]]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for source in sources {
        for (name, value) in source.iter() {
            if let Some(existing) = out.iter_mut().find(|(n, _)| n == name) {
                existing.1 = value.clone();
            } else {
                out.push((name.clone(), value.clone()));
            }
        }
    }
    out
}

/// SHA-256 over the RFC 8785 canonicalization of the composed payload.
fn payload_fingerprint(settings: &SettingListMessage, slice: &SliceMessage) -> Option<String> {
    let composed = serde_json::json!({
        "settings": settings,
        "slice": slice,
    });
    let jcs_bytes = match serde_json_canonicalizer::to_vec(&composed) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to canonicalize slice payload for fingerprinting: {}", e);
            return None;
        }
    };
    let mut hasher = Sha256::new();
    hasher.update(&jcs_bytes);
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_space_swaps_and_inverts() {
        let mapped = to_engine_space(Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(mapped, Vector3::new(1.0, 3.0, -2.0));
    }

    #[test]
    fn test_flatten_pairs_orders_and_overwrites() {
        let group = vec![("layer_height".to_string(), "0.2".to_string())];
        let profile = vec![
            ("speed".to_string(), "40".to_string()),
            ("layer_height".to_string(), "0.3".to_string()),
        ];
        let overrides = vec![("speed".to_string(), "50".to_string())];

        let flattened = flatten_pairs(&[&group, &profile, &overrides]);
        assert_eq!(
            flattened,
            vec![
                ("layer_height".to_string(), "0.3".to_string()),
                ("speed".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let settings = SettingListMessage {
            settings: vec![SettingPair::new("layer_height", "0.2")],
        };
        let mut slice = SliceMessage::default();
        slice.add_object_list().add_object().id = 1;

        let a = payload_fingerprint(&settings, &slice).unwrap();
        let b = payload_fingerprint(&settings, &slice).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_settings = SettingListMessage {
            settings: vec![SettingPair::new("layer_height", "0.3")],
        };
        assert_ne!(payload_fingerprint(&other_settings, &slice).unwrap(), a);
    }
}
