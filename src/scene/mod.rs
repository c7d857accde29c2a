//! Scene model: printable objects, groups, and traversal.
//!
//! The scene is a tree of nodes guarded by a single exclusive lock. Nodes
//! carry an optional mesh, a world transform, per-object setting overrides,
//! and decorations (group membership, stale slice-result data). The payload
//! builder holds the lock only while snapshotting groups and releases it
//! before any serialization or transport work.

pub mod loader;
pub mod math;
pub mod order;

pub use loader::SceneError;
pub use math::{Matrix4, Vector3};
pub use order::{PrintOrder, ScanOrder};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared vertex data in model space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshData {
    pub vertices: Vec<Vector3>,
}

impl MeshData {
    pub fn from_vertices(vertices: Vec<Vector3>) -> Self {
        Self { vertices }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }
}

/// One node of the scene tree.
#[derive(Debug, Clone)]
pub struct SceneNode {
    id: u64,
    name: String,
    mesh: Option<Arc<MeshData>>,
    world_transform: Matrix4,
    outside_build_area: bool,
    is_group: bool,
    has_layer_data: bool,
    profile: Vec<(String, String)>,
    per_object_settings: Vec<(String, String)>,
    children: Vec<SceneNode>,
}

impl SceneNode {
    /// Create a node with a fresh scene-unique id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            mesh: None,
            world_transform: Matrix4::identity(),
            outside_build_area: false,
            is_group: false,
            has_layer_data: false,
            profile: Vec::new(),
            per_object_settings: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_mesh(mut self, mesh: Arc<MeshData>) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn with_transform(mut self, transform: Matrix4) -> Self {
        self.world_transform = transform;
        self
    }

    pub fn as_group(mut self) -> Self {
        self.is_group = true;
        self
    }

    pub fn with_layer_data(mut self) -> Self {
        self.has_layer_data = true;
        self
    }

    pub fn outside_build_area(mut self) -> Self {
        self.outside_build_area = true;
        self
    }

    /// Attach an object profile (ordered name/value pairs).
    pub fn with_profile(mut self, profile: Vec<(String, String)>) -> Self {
        self.profile = profile;
        self
    }

    /// Attach raw per-object setting overrides (ordered name/value pairs).
    pub fn with_settings(mut self, settings: Vec<(String, String)>) -> Self {
        self.per_object_settings = settings;
        self
    }

    pub fn add_child(&mut self, child: SceneNode) {
        self.children.push(child);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mesh(&self) -> Option<&Arc<MeshData>> {
        self.mesh.as_ref()
    }

    pub fn world_transform(&self) -> &Matrix4 {
        &self.world_transform
    }

    pub fn is_outside_build_area(&self) -> bool {
        self.outside_build_area
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    pub fn has_layer_data(&self) -> bool {
        self.has_layer_data
    }

    pub fn profile(&self) -> &[(String, String)] {
        &self.profile
    }

    pub fn per_object_settings(&self) -> &[(String, String)] {
        &self.per_object_settings
    }

    pub fn children(&self) -> &[SceneNode] {
        &self.children
    }

    /// Whether this node contributes printable geometry.
    pub fn has_printable_mesh(&self) -> bool {
        self.mesh
            .as_ref()
            .map(|mesh| mesh.vertex_count() > 0)
            .unwrap_or(false)
    }
}

/// The scene tree; accessed through [`Scene::lock`].
#[derive(Debug, Clone)]
pub struct SceneTree {
    root: SceneNode,
}

impl SceneTree {
    pub fn new() -> Self {
        Self {
            root: SceneNode::new("root"),
        }
    }

    pub fn root(&self) -> &SceneNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut SceneNode {
        &mut self.root
    }

    /// Pre-order depth-first traversal, root first.
    pub fn depth_first(&self) -> DepthFirstIter<'_> {
        DepthFirstIter {
            stack: vec![&self.root],
        }
    }

    /// Find a node anywhere in the tree by id.
    pub fn find(&self, id: u64) -> Option<&SceneNode> {
        self.depth_first().find(|node| node.id() == id)
    }

    /// Remove the first node (depth-first) carrying stale slice-result
    /// data. At most one node is removed per call.
    pub fn purge_layer_data(&mut self) -> bool {
        fn purge(node: &mut SceneNode) -> bool {
            for index in 0..node.children.len() {
                if node.children[index].has_layer_data {
                    node.children.remove(index);
                    return true;
                }
                if purge(&mut node.children[index]) {
                    return true;
                }
            }
            false
        }
        purge(&mut self.root)
    }
}

impl Default for SceneTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-order depth-first iterator over a scene tree.
pub struct DepthFirstIter<'a> {
    stack: Vec<&'a SceneNode>,
}

impl<'a> Iterator for DepthFirstIter<'a> {
    type Item = &'a SceneNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children.iter().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}

/// The shared scene, guarded by one exclusive lock.
pub struct Scene {
    tree: Mutex<SceneTree>,
}

impl Scene {
    pub fn new(tree: SceneTree) -> Self {
        Self {
            tree: Mutex::new(tree),
        }
    }

    /// Acquire exclusive access to the tree.
    pub fn lock(&self) -> MutexGuard<'_, SceneTree> {
        self.tree.lock().expect("scene lock poisoned")
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new(SceneTree::new())
    }
}
