//! Scene file loading for the CLI.
//!
//! A scene file is a JSON document describing the object tree: vertices in
//! model space, an optional translation, group markers, and per-object
//! setting overrides as ordered name/value pairs.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::scene::math::{Matrix4, Vector3};
use crate::scene::{MeshData, SceneNode, SceneTree};

/// Errors from scene file loading.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("I/O error reading '{path}': {message}")]
    Io { path: String, message: String },

    #[error("JSON parse error in '{path}': {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Deserialize)]
struct SceneFile {
    #[serde(default)]
    objects: Vec<SceneFileNode>,
}

#[derive(Debug, Deserialize)]
struct SceneFileNode {
    name: String,
    #[serde(default)]
    vertices: Vec<[f32; 3]>,
    #[serde(default)]
    translation: Option<[f32; 3]>,
    #[serde(default)]
    outside_build_area: bool,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    profile: Vec<(String, String)>,
    #[serde(default)]
    settings: Vec<(String, String)>,
    #[serde(default)]
    children: Vec<SceneFileNode>,
}

/// Load a scene tree from a JSON file.
pub fn load_scene(path: &Path) -> Result<SceneTree, SceneError> {
    let bytes = fs::read(path).map_err(|e| SceneError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let file: SceneFile = serde_json::from_slice(&bytes).map_err(|e| SceneError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(build_tree(file))
}

/// Parse a scene tree from a JSON string.
pub fn scene_from_json_str(json: &str) -> Result<SceneTree, SceneError> {
    let file: SceneFile = serde_json::from_str(json).map_err(|e| SceneError::Parse {
        path: "<inline>".to_string(),
        message: e.to_string(),
    })?;
    Ok(build_tree(file))
}

fn build_tree(file: SceneFile) -> SceneTree {
    let mut tree = SceneTree::new();
    for object in file.objects {
        let node = build_node(object);
        tree.root_mut().add_child(node);
    }
    tree
}

fn build_node(file_node: SceneFileNode) -> SceneNode {
    let mut node = SceneNode::new(file_node.name);

    if !file_node.vertices.is_empty() {
        let vertices = file_node
            .vertices
            .into_iter()
            .map(|[x, y, z]| Vector3::new(x, y, z))
            .collect();
        node = node.with_mesh(Arc::new(MeshData::from_vertices(vertices)));
    }
    if let Some([x, y, z]) = file_node.translation {
        node = node.with_transform(Matrix4::translation(x, y, z));
    }
    if file_node.outside_build_area {
        node = node.outside_build_area();
    }
    if file_node.is_group {
        node = node.as_group();
    }
    node = node
        .with_profile(file_node.profile)
        .with_settings(file_node.settings);

    for child in file_node.children {
        node.add_child(build_node(child));
    }
    node
}
