//! The two recursive per-subtree routines from spec §4.1: `RefitAndMark` and
//! `RefitAndMeasure`. Both walk a single refit-root's subtree top-down,
//! recomputing AABBs bottom-up as the recursion unwinds. Neither one touches
//! anything outside the subtree rooted at the `ChildRecord` it is given —
//! the cross-refit-root fan-in climb lives in [`crate::refit`].

use crate::tree::{ChildRecord, NodeIndex, Tree};

/// Bottom-up AABB repair of the subtree at `child.node_index()`, recording
/// any wavefront node encountered (`leaf_count <= leaf_threshold`) into
/// `candidates` and refitting it (and everything below it) with
/// [`refit_and_measure`] instead of recursing further with marking.
///
/// Returns the sum of `post - pre` bounds-metric deltas over every internal
/// node visited, including `child` itself.
pub fn refit_and_mark(
    tree: &Tree,
    child: &mut ChildRecord,
    leaf_threshold: u32,
    candidates: &mut Vec<NodeIndex>,
) -> f32 {
    if child.is_leaf() {
        return 0.0;
    }

    let node_index = child
        .node_index()
        .expect("checked not-leaf above, node_index must be Some");

    if child.leaf_count <= leaf_threshold {
        candidates.push(node_index);
        return refit_and_measure(tree, child);
    }

    let pre = child.aabb().bounds_metric();

    // SAFETY: `child` belongs to a subtree exclusively owned by the calling
    // worker (either its refit-root subtree, or — for the shared-ancestor
    // portion — a node this worker was the sole last-arrival for).
    let node = unsafe { tree.node_mut(node_index) };

    let mut cost_change = refit_and_mark(tree, &mut node.children[0], leaf_threshold, candidates);
    cost_change += refit_and_mark(tree, &mut node.children[1], leaf_threshold, candidates);

    let new_aabb = node.own_aabb();
    child.set_aabb(new_aabb);
    cost_change += new_aabb.bounds_metric() - pre;
    cost_change
}

/// Identical to [`refit_and_mark`] but never appends candidates — used once a
/// wavefront node has been found (no further marking below it is needed) and
/// for refit-roots the wavefront collector already sign-encoded as
/// "measure-only" (spec §4.2).
pub fn refit_and_measure(tree: &Tree, child: &mut ChildRecord) -> f32 {
    if child.is_leaf() {
        return 0.0;
    }

    let node_index = child
        .node_index()
        .expect("checked not-leaf above, node_index must be Some");
    let pre = child.aabb().bounds_metric();

    // SAFETY: see refit_and_mark.
    let node = unsafe { tree.node_mut(node_index) };

    let mut cost_change = refit_and_measure(tree, &mut node.children[0]);
    cost_change += refit_and_measure(tree, &mut node.children[1]);

    let new_aabb = node.own_aabb();
    child.set_aabb(new_aabb);
    cost_change += new_aabb.bounds_metric() - pre;
    cost_change
}
