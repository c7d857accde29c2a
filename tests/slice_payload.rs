//! End-to-end slice job behavior against a recording sink.

use std::sync::Arc;

use serde_json::Value;

use slicebridge::job::{GcodeWarning, JobContext, SliceJob, SliceJobOutcome};
use slicebridge::machine::MachineTopology;
use slicebridge::scene::math::{Matrix4, Vector3};
use slicebridge::scene::{MeshData, ScanOrder, Scene, SceneNode, SceneTree};
use slicebridge::settings::definition::DefinitionContainer;
use slicebridge::settings::stack::ContainerStack;
use slicebridge::transport::RecordingSink;
use slicebridge_proto::EngineMessage;

const GLOBAL_DEFINITION: &str = r#"{
    "id": "fdmprinter",
    "settings": [
        { "key": "machine_extruder_count", "default_value": 1 },
        { "key": "print_sequence", "default_value": "all_at_once" },
        { "key": "layer_height", "default_value": 0.2 },
        { "key": "material_bed_temperature", "default_value": 60 },
        { "key": "material_print_temperature", "default_value": 210 },
        {
            "key": "machine_start_gcode",
            "default_value": "M140 S{material_bed_temperature}\nG28 ;{foo}"
        },
        { "key": "machine_end_gcode", "default_value": "M104 S0" }
    ]
}"#;

fn build_machine() -> Arc<MachineTopology> {
    let global = Arc::new(ContainerStack::new("global"));
    global.push_container(Arc::new(
        DefinitionContainer::from_json_str(GLOBAL_DEFINITION).unwrap(),
    ));
    Arc::new(MachineTopology::with_global(global))
}

fn mesh(vertices: &[(f32, f32, f32)]) -> Arc<MeshData> {
    Arc::new(MeshData::from_vertices(
        vertices
            .iter()
            .map(|&(x, y, z)| Vector3::new(x, y, z))
            .collect(),
    ))
}

fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn run_job(machine: Arc<MachineTopology>, tree: SceneTree) -> (Arc<RecordingSink>, slicebridge::SliceJobReport) {
    let sink = Arc::new(RecordingSink::new());
    let job = SliceJob::new(
        Arc::new(Scene::new(tree)),
        machine,
        Box::new(ScanOrder),
        sink.clone(),
    );
    let report = job.run(&JobContext::new()).unwrap();
    (sink, report)
}

fn sent_setting(sink: &RecordingSink, name: &str) -> Option<String> {
    sink.sent().iter().find_map(|message| match message {
        EngineMessage::SettingList(list) => list.get(name).map(|v| v.into_owned()),
        _ => None,
    })
}

#[test]
fn empty_scene_is_a_successful_no_op() {
    let (sink, report) = run_job(build_machine(), SceneTree::new());

    assert_eq!(report.outcome, SliceJobOutcome::NothingToSlice);
    assert_eq!(sink.sent_count(), 0);
    assert!(report.payload_fingerprint.is_none());
}

#[test]
fn outside_build_area_objects_are_skipped() {
    let mut tree = SceneTree::new();
    tree.root_mut().add_child(
        SceneNode::new("stray")
            .with_mesh(mesh(&[(0.0, 0.0, 0.0)]))
            .outside_build_area(),
    );

    let (sink, report) = run_job(build_machine(), tree);
    assert_eq!(report.outcome, SliceJobOutcome::NothingToSlice);
    assert_eq!(sink.sent_count(), 0);
}

#[test]
fn settings_are_sent_before_the_slice_message() {
    let mut tree = SceneTree::new();
    tree.root_mut()
        .add_child(SceneNode::new("cube").with_mesh(mesh(&[(1.0, 2.0, 3.0)])));

    let (sink, report) = run_job(build_machine(), tree);

    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(sent[0], EngineMessage::SettingList(_)));
    assert!(matches!(sent[1], EngineMessage::Slice(_)));
    assert!(matches!(report.outcome, SliceJobOutcome::Sent { .. }));
    assert!(report.payload_fingerprint.is_some());
}

#[test]
fn vertices_map_into_engine_space() {
    let mut tree = SceneTree::new();
    tree.root_mut().add_child(
        SceneNode::new("cube")
            .with_mesh(mesh(&[(1.0, 2.0, 3.0), (4.0, 5.0, 6.0)]))
            .with_transform(Matrix4::translation(10.0, 0.0, 0.0)),
    );

    let (sink, _report) = run_job(build_machine(), tree);

    let sent = sink.sent();
    let EngineMessage::Slice(slice) = &sent[1] else {
        panic!("expected slice message");
    };
    let object = &slice.object_lists[0].objects[0];
    // World transform first, then (x, y, z) -> (x, z, -y).
    assert_eq!(object.vertices, vec![11.0, 3.0, -2.0, 14.0, 6.0, -5.0]);
}

#[test]
fn group_profile_precedes_object_overrides() {
    let mut tree = SceneTree::new();
    let mut group = SceneNode::new("stand")
        .as_group()
        .with_profile(pairs(&[("layer_height", "0.2")]));
    group.add_child(
        SceneNode::new("leg")
            .with_mesh(mesh(&[(0.0, 0.0, 0.0)]))
            .with_settings(pairs(&[("speed", "50")])),
    );
    tree.root_mut().add_child(group);

    let (sink, _report) = run_job(build_machine(), tree);

    let sent = sink.sent();
    let EngineMessage::Slice(slice) = &sent[1] else {
        panic!("expected slice message");
    };
    let object = &slice.object_lists[0].objects[0];
    let names: Vec<&str> = object.settings.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["layer_height", "speed"]);
    assert_eq!(object.settings[0].value_str(), "0.2");
    assert_eq!(object.settings[1].value_str(), "50");
}

#[test]
fn start_gcode_tokens_expand_with_warnings_for_unknowns() {
    let mut tree = SceneTree::new();
    tree.root_mut()
        .add_child(SceneNode::new("cube").with_mesh(mesh(&[(0.0, 0.0, 0.0)])));

    let (sink, report) = run_job(build_machine(), tree);

    let start_gcode = sent_setting(&sink, "machine_start_gcode").unwrap();
    assert_eq!(start_gcode, "M140 S60\nG28 ;{foo}");
    assert!(report
        .gcode_warnings
        .contains(&GcodeWarning::UnknownKey("foo".to_string())));

    // Non-gcode settings are plain stringifications.
    assert_eq!(sent_setting(&sink, "layer_height").as_deref(), Some("0.2"));
    assert_eq!(
        sent_setting(&sink, "material_bed_temperature").as_deref(),
        Some("60")
    );
}

#[test]
fn temperature_prepend_flags_are_synthesized() {
    let mut tree = SceneTree::new();
    tree.root_mut()
        .add_child(SceneNode::new("cube").with_mesh(mesh(&[(0.0, 0.0, 0.0)])));

    let (sink, _report) = run_job(build_machine(), tree);

    // The start gcode references the bed temperature but not the print
    // temperature.
    assert_eq!(
        sent_setting(&sink, "material_bed_temp_prepend").as_deref(),
        Some("false")
    );
    assert_eq!(
        sent_setting(&sink, "material_print_temp_prepend").as_deref(),
        Some("true")
    );
}

#[test]
fn all_at_once_produces_a_single_group() {
    let mut tree = SceneTree::new();
    tree.root_mut()
        .add_child(SceneNode::new("a").with_mesh(mesh(&[(0.0, 0.0, 0.0)])));
    tree.root_mut()
        .add_child(SceneNode::new("b").with_mesh(mesh(&[(1.0, 0.0, 0.0)])));

    let (sink, report) = run_job(build_machine(), tree);

    let sent = sink.sent();
    let EngineMessage::Slice(slice) = &sent[1] else {
        panic!("expected slice message");
    };
    assert_eq!(slice.object_lists.len(), 1);
    assert_eq!(slice.object_lists[0].objects.len(), 2);
    assert_eq!(
        report.outcome,
        SliceJobOutcome::Sent {
            group_count: 1,
            object_count: 2,
            settings_sent: 9,
        }
    );
}

#[test]
fn one_at_a_time_produces_singleton_groups_in_order() {
    let machine = build_machine();
    machine
        .global_stack()
        .unwrap()
        .set_user_value("print_sequence", Value::from("one_at_a_time"));

    let mut tree = SceneTree::new();
    let a = SceneNode::new("a").with_mesh(mesh(&[(0.0, 0.0, 0.0)]));
    let skipped = SceneNode::new("skipped")
        .with_mesh(mesh(&[(2.0, 0.0, 0.0)]))
        .outside_build_area();
    let b = SceneNode::new("b").with_mesh(mesh(&[(1.0, 0.0, 0.0)]));
    let (id_a, id_b) = (a.id(), b.id());
    tree.root_mut().add_child(a);
    tree.root_mut().add_child(skipped);
    tree.root_mut().add_child(b);

    let (sink, _report) = run_job(machine, tree);

    let sent = sink.sent();
    let EngineMessage::Slice(slice) = &sent[1] else {
        panic!("expected slice message");
    };
    assert_eq!(slice.object_lists.len(), 2);
    assert_eq!(slice.object_lists[0].objects[0].id, id_a);
    assert_eq!(slice.object_lists[1].objects[0].id, id_b);
}

#[test]
fn one_at_a_time_groups_keep_descendants_together() {
    let machine = build_machine();
    machine
        .global_stack()
        .unwrap()
        .set_user_value("print_sequence", Value::from("one_at_a_time"));

    let mut tree = SceneTree::new();
    let mut tower = SceneNode::new("tower").with_mesh(mesh(&[(0.0, 0.0, 0.0)]));
    tower.add_child(SceneNode::new("antenna").with_mesh(mesh(&[(0.0, 0.0, 5.0)])));
    tower.add_child(SceneNode::new("marker"));
    tree.root_mut().add_child(tower);

    let (sink, _report) = run_job(machine, tree);

    let sent = sink.sent();
    let EngineMessage::Slice(slice) = &sent[1] else {
        panic!("expected slice message");
    };
    assert_eq!(slice.object_lists.len(), 1);
    // Mesh-bearing descendants come before the top node itself; the
    // meshless marker is dropped.
    let names = &slice.object_lists[0].objects;
    assert_eq!(names.len(), 2);
}

#[test]
fn stale_layer_data_is_purged_from_the_scene() {
    let mut tree = SceneTree::new();
    tree.root_mut()
        .add_child(SceneNode::new("old_layers").with_layer_data());
    tree.root_mut()
        .add_child(SceneNode::new("cube").with_mesh(mesh(&[(0.0, 0.0, 0.0)])));

    let scene = Arc::new(Scene::new(tree));
    let sink = Arc::new(RecordingSink::new());
    let job = SliceJob::new(
        scene.clone(),
        build_machine(),
        Box::new(ScanOrder),
        sink.clone(),
    );
    job.run(&JobContext::new()).unwrap();

    let names: Vec<String> = scene
        .lock()
        .depth_first()
        .map(|n| n.name().to_string())
        .collect();
    assert_eq!(names, vec!["root", "cube"]);
}

#[test]
fn cancelled_job_sends_nothing() {
    let mut tree = SceneTree::new();
    tree.root_mut()
        .add_child(SceneNode::new("cube").with_mesh(mesh(&[(0.0, 0.0, 0.0)])));

    let sink = Arc::new(RecordingSink::new());
    let job = SliceJob::new(
        Arc::new(Scene::new(tree)),
        build_machine(),
        Box::new(ScanOrder),
        sink.clone(),
    );

    let context = JobContext::new();
    context.token().cancel();
    let report = job.run(&context).unwrap();

    assert_eq!(report.outcome, SliceJobOutcome::Cancelled);
    assert_eq!(sink.sent_count(), 0);
}

#[test]
fn job_runs_to_completion_on_a_worker_thread() {
    let mut tree = SceneTree::new();
    tree.root_mut()
        .add_child(SceneNode::new("cube").with_mesh(mesh(&[(0.0, 0.0, 0.0)])));

    let sink = Arc::new(RecordingSink::new());
    let job = SliceJob::new(
        Arc::new(Scene::new(tree)),
        build_machine(),
        Box::new(ScanOrder),
        sink.clone(),
    );

    let handle = slicebridge::job::spawn(job).unwrap();
    let report = handle.wait().unwrap();

    assert!(matches!(report.outcome, SliceJobOutcome::Sent { .. }));
    assert_eq!(sink.sent_count(), 2);
}

#[test]
fn reports_carry_fingerprint_and_unique_job_ids() {
    let machine = build_machine();

    let build_tree = || {
        let mut tree = SceneTree::new();
        tree.root_mut()
            .add_child(SceneNode::new("cube").with_mesh(mesh(&[(0.0, 0.0, 0.0)])));
        tree
    };

    let (_, first) = run_job(machine.clone(), build_tree());
    let (_, second) = run_job(machine, build_tree());

    assert!(first.payload_fingerprint.is_some());
    assert!(second.payload_fingerprint.is_some());
    assert_ne!(first.job_id, second.job_id);
    assert!(first.finished_at >= first.started_at);
}
