//! Wavefront collector (spec §4.2): single-threaded, runs on the main thread
//! before the refit-and-mark dispatch. Descends from the root, splitting the
//! tree into refit-roots (subtrees handed whole to one worker) and an initial
//! set of refinement candidates, while leaving every visited internal node's
//! `refine_flag` holding a fan-in count for the upcoming parallel climb.

use crate::tree::{encode_leaf, NodeIndex, Tree};
use std::sync::atomic::Ordering;

/// `max(leafCount / (2 * workerCount), refinementLeafCountThreshold)` — large
/// enough that a balanced tree yields roughly `2 * workerCount` refit-roots
/// (enough to load-balance via atomic claim), never smaller than the
/// refinement threshold (a refit-root always contains at least one
/// leaf-count-threshold-sized candidate).
pub fn multithreading_leaf_count_threshold(
    leaf_count: u32,
    worker_count: u32,
    refinement_leaf_count_threshold: u32,
) -> u32 {
    (leaf_count / (2 * worker_count.max(1))).max(refinement_leaf_count_threshold)
}

/// Fills `refit_roots` (sign-encoded: positive entries use `RefitAndMark`,
/// negative ones decode to a node index and use `RefitAndMeasure`) and
/// `candidates` (one list per worker, seeded on worker 0 with whatever
/// wavefront nodes the collector itself discovers). Both are caller-supplied
/// — drawn from the [`crate::pool::BufferPool`]/[`crate::pool::ThreadBufferPool`]
/// before this call (spec §5 "no allocations ... in the atomic hot loops"
/// extends to the setup phase preceding them: the main pass only ever grows
/// these through the pool, never by itself) — and cleared by this function
/// before the walk.
pub fn collect_refit_roots(
    tree: &Tree,
    worker_count: u32,
    refinement_leaf_count_threshold: u32,
    refit_roots: &mut Vec<i32>,
    candidates: &mut [Vec<NodeIndex>],
) {
    let threshold = multithreading_leaf_count_threshold(
        tree.leaf_count(),
        worker_count,
        refinement_leaf_count_threshold,
    );

    refit_roots.clear();
    for list in candidates.iter_mut() {
        list.clear();
    }

    if tree.has_root() {
        visit(
            tree,
            Tree::ROOT,
            threshold,
            refinement_leaf_count_threshold,
            refit_roots,
            candidates,
        );
    }
}

fn visit(
    tree: &Tree,
    node_index: NodeIndex,
    threshold: u32,
    refinement_leaf_count_threshold: u32,
    refit_roots: &mut Vec<i32>,
    candidates: &mut [Vec<NodeIndex>],
) {
    let node = tree.node(node_index);
    let mut internal_children = 0i32;

    for child in &node.children {
        let Some(child_index) = child.node_index() else {
            continue;
        };
        internal_children += 1;

        if child.leaf_count > threshold {
            visit(
                tree,
                child_index,
                threshold,
                refinement_leaf_count_threshold,
                refit_roots,
                candidates,
            );
        } else if child.leaf_count <= refinement_leaf_count_threshold {
            candidates[0].push(child_index);
            refit_roots.push(encode_leaf(child_index));
        } else {
            refit_roots.push(child_index as i32);
        }
    }

    tree.metanode(node_index)
        .refine_flag
        .store(internal_children, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Aabb;
    use crate::tree::{ChildRecord, Metanode, Node};

    fn leaf(id: u32) -> ChildRecord {
        ChildRecord::leaf(id, Aabb { min: [0.0; 3], max: [1.0; 3] })
    }

    #[test]
    fn threshold_grows_with_leaf_count_and_shrinks_with_worker_count() {
        assert_eq!(multithreading_leaf_count_threshold(1000, 1, 4), 500);
        assert_eq!(multithreading_leaf_count_threshold(1000, 4, 4), 125);
        // never below the refinement floor
        assert_eq!(multithreading_leaf_count_threshold(4, 8, 4), 4);
    }

    /// root -> {A (leaf_count=2, all leaves), B (leaf_count=2, all leaves)}
    /// With a threshold that classifies both as refit-roots and a refinement
    /// threshold that also admits both as candidates.
    fn small_tree() -> Tree {
        let a = Node::new(leaf(0), leaf(1));
        let b = Node::new(leaf(2), leaf(3));
        let root = Node::new(
            ChildRecord::internal(1, a.own_aabb(), 2),
            ChildRecord::internal(2, b.own_aabb(), 2),
        );
        Tree::new(
            vec![root, a, b],
            vec![Metanode::root(), Metanode::child(0, 0), Metanode::child(0, 1)],
            4,
        )
    }

    #[test]
    fn both_children_become_sign_encoded_refit_roots_when_within_refinement_threshold() {
        let tree = small_tree();
        let mut refit_roots = Vec::new();
        let mut candidates = vec![Vec::new()];
        collect_refit_roots(&tree, 1, /* refinement_leaf_count_threshold */ 2, &mut refit_roots, &mut candidates);

        assert_eq!(refit_roots.len(), 2);
        assert!(refit_roots.iter().all(|&r| r < 0));
        assert_eq!(candidates[0].len(), 2);
        assert_eq!(tree.metanode(0).refine_flag.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn children_above_refinement_threshold_are_unencoded_refit_roots() {
        let tree = small_tree();
        // refinement threshold of 1 means leaf_count=2 children don't qualify
        // as candidates, but they're still small enough (threshold computed
        // from worker_count=1 -> max(4/2, 1) = 2) to stop recursion there.
        let mut refit_roots = Vec::new();
        let mut candidates = vec![Vec::new()];
        collect_refit_roots(&tree, 1, 1, &mut refit_roots, &mut candidates);

        assert_eq!(refit_roots.len(), 2);
        assert!(refit_roots.iter().all(|&r| r >= 0));
        assert!(candidates.iter().all(Vec::is_empty));
    }

    #[test]
    fn deep_recursion_sets_refine_flag_on_every_visited_spine_node() {
        // root -> {leaf, C}; C -> {D, leaf}; D -> {leaf, leaf}
        let d = Node::new(leaf(0), leaf(1));
        let c = Node::new(ChildRecord::internal(2, d.own_aabb(), 2), leaf(2));
        let root = Node::new(leaf(3), ChildRecord::internal(1, c.own_aabb(), 3));

        let tree = Tree::new(
            vec![root, c, d],
            vec![
                Metanode::root(),
                Metanode::child(0, 1),
                Metanode::child(1, 0),
            ],
            4,
        );

        // Force recursion past C by setting worker_count=1 and a generous
        // refinement threshold, but require a leaf-count threshold small
        // enough that C must be descended into to reach D as the refit-root.
        let mut refit_roots = Vec::new();
        let mut candidates = vec![Vec::new()];
        collect_refit_roots(&tree, 1, 1, &mut refit_roots, &mut candidates);

        assert_eq!(tree.metanode(0).refine_flag.load(Ordering::SeqCst), 1);
        assert_eq!(tree.metanode(1).refine_flag.load(Ordering::SeqCst), 1);
        assert_eq!(refit_roots, vec![2]);
    }

    #[test]
    fn reused_buffers_are_cleared_before_the_walk() {
        let tree = small_tree();
        let mut refit_roots = vec![99, 98, 97];
        let mut candidates = vec![vec![7, 8, 9]];
        collect_refit_roots(&tree, 1, 2, &mut refit_roots, &mut candidates);

        assert_eq!(refit_roots.len(), 2);
        assert!(!refit_roots.contains(&99));
        assert_eq!(candidates[0].len(), 2);
        assert!(!candidates[0].contains(&7));
    }
}
