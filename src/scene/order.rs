//! Print-order collaborators for one-at-a-time sequencing.
//!
//! Deciding a safe print order for one-at-a-time mode is a spatial problem
//! (print-head clearance over already-printed objects) owned by the host
//! application. The payload builder only consumes the resulting order
//! through this trait.

use crate::scene::SceneTree;

/// Supplies the order in which top-level objects print one at a time.
pub trait PrintOrder: Send + Sync {
    /// Node ids of the root's children in print order, or `None` when no
    /// valid order exists.
    fn order(&self, tree: &SceneTree) -> Option<Vec<u64>>;
}

/// Fallback order: scene traversal order of the root's children.
pub struct ScanOrder;

impl PrintOrder for ScanOrder {
    fn order(&self, tree: &SceneTree) -> Option<Vec<u64>> {
        let ids: Vec<u64> = tree.root().children().iter().map(|node| node.id()).collect();
        if ids.is_empty() {
            None
        } else {
            Some(ids)
        }
    }
}
