//! Binned surface-area-heuristic treelet builder.
//!
//! `BinnedRefine` is assumed available by the refine workers; this module is
//! the concrete implementation they call. It mirrors the teacher's
//! `TreeBuilder` (`binary_tree/tree_builder.rs`) in spirit — the one builder
//! used both to construct a tree from scratch and (here) to rebuild a single
//! treelet in place — but the split rule is a binned SAH sweep rather than a
//! perfect/sparse layout, since the input is a live set of moving leaves
//! rather than a fixed coordinate space.

use crate::geometry::Aabb;
use crate::tree::{ChildRecord, LeafId, Metanode, Node, NodeIndex, Tree};
use rayon::prelude::*;

/// Number of bins the dominant centroid axis is divided into when searching
/// for the cheapest split plane. 16 is the usual middle ground between split
/// quality and sweep cost for treelets of a few hundred subtrees.
pub const SAH_BIN_COUNT: usize = 16;

/// Builds a whole tree from scratch over a flat set of leaves, using the same
/// binned-SAH split as [`BinnedRefine`] uses per-treelet. `spec.md` treats
/// initial bulk construction as an external collaborator this engine never
/// needs to run itself; this exists only so tests/benches have a starting
/// tree to refit, the same role the teacher's `TreeBuilder`
/// (`binary_tree/tree_builder.rs`) fills for tests that need a tree before
/// they can exercise anything else.
pub fn build_bulk(leaves: &[(LeafId, Aabb)]) -> Tree {
    if leaves.len() < 2 {
        return Tree::new(Vec::new(), Vec::new(), leaves.len() as u32);
    }

    let mut subtree_refs: Vec<ChildRecord> = leaves
        .iter()
        .map(|&(id, aabb)| ChildRecord::leaf(id, aabb))
        .collect();

    // Mirrors the teacher's `par_sort_by` over centroid keys before the
    // recursive split (`binary_tree/multi_threaded_builder.rs`): cheap
    // parallel prep that doesn't need the atomic work-claim coordination the
    // rest of this crate reserves for the three per-frame dispatches.
    subtree_refs.par_sort_by(|a, b| {
        a.aabb().centroid()[0]
            .partial_cmp(&b.aabb().centroid()[0])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let plan = build_binned_sah(&subtree_refs, SAH_BIN_COUNT);

    let mut nodes = Vec::new();
    let mut metanodes = Vec::new();
    materialize(&subtree_refs, &plan.root, &mut nodes, &mut metanodes, None, 0);

    Tree::new(nodes, metanodes, leaves.len() as u32)
}

/// Recursive counterpart of [`write_node`] used only by [`build_bulk`]: there
/// is no existing [`Tree`] yet to write into, so internal nodes are appended
/// to plain `Vec`s instead. The treelet root is always pushed first, so for a
/// whole-tree build that means slot 0 — satisfying `Tree::ROOT`.
fn materialize(
    subtree_refs: &[ChildRecord],
    node: &TreeletNode,
    nodes: &mut Vec<Node>,
    metanodes: &mut Vec<Metanode>,
    parent: Option<NodeIndex>,
    index_in_parent: u8,
) -> ChildRecord {
    match node {
        TreeletNode::Leaf(i) => subtree_refs[*i],
        TreeletNode::Split(left, right) => {
            let slot = nodes.len() as NodeIndex;
            // Reserve the slot before recursing so children's parent
            // back-references can point at it; patched with real contents
            // once both children are known.
            nodes.push(Node::new(
                ChildRecord::leaf(0, Aabb::EMPTY),
                ChildRecord::leaf(0, Aabb::EMPTY),
            ));
            metanodes.push(match parent {
                Some(p) => Metanode::child(p, index_in_parent),
                None => Metanode::root(),
            });

            let left_record = materialize(subtree_refs, left, nodes, metanodes, Some(slot), 0);
            let right_record = materialize(subtree_refs, right, nodes, metanodes, Some(slot), 1);

            nodes[slot as usize] = Node::new(left_record, right_record);

            ChildRecord::internal(
                slot,
                left_record.aabb().union(&right_record.aabb()),
                left_record.leaf_count + right_record.leaf_count,
            )
        }
    }
}

/// Walks down from `node_index`, at each step expanding the subtree-root
/// entry with the largest leaf count into its two children, until the flat
/// set reaches `max_subtrees` entries or has no more internal entries left to
/// expand. `node_index` itself is always the first entry expanded (its slot
/// is always reclaimed), so the result always contains at least two entries
/// for any non-leaf input.
///
/// `subtree_refs` and `reclaimed_slots` are caller-supplied scratch (a
/// refine worker's thread-local [`crate::pool::ThreadBufferPool`] buffers,
/// spec §4.5) and are cleared before the walk.
pub fn collapse_subtree(
    tree: &Tree,
    node_index: NodeIndex,
    max_subtrees: usize,
    subtree_refs: &mut Vec<ChildRecord>,
    reclaimed_slots: &mut Vec<NodeIndex>,
) {
    subtree_refs.clear();
    reclaimed_slots.clear();

    let root_node = tree.node(node_index);
    subtree_refs.push(ChildRecord::internal(
        node_index,
        root_node.own_aabb(),
        root_node.own_leaf_count(),
    ));

    // The treelet root always expands at least once, even if `max_subtrees`
    // is 1 — a cap below 2 would otherwise leave nothing to rebuild.
    let cap = max_subtrees.max(2);

    while subtree_refs.len() < cap {
        let widest = subtree_refs
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_leaf())
            .max_by_key(|(_, r)| r.leaf_count)
            .map(|(i, _)| i);

        let Some(i) = widest else { break };
        let entry = subtree_refs.swap_remove(i);
        let idx = entry
            .node_index()
            .expect("filtered to internal entries above");
        reclaimed_slots.push(idx);

        let node = tree.node(idx);
        subtree_refs.push(node.children[0]);
        subtree_refs.push(node.children[1]);
    }
}

/// A binned-SAH treelet shape over the flat subtree-ref set: either a single
/// subtree (by index into the ref slice) or a binary split of two further
/// plans.
pub enum TreeletNode {
    Leaf(usize),
    Split(Box<TreeletNode>, Box<TreeletNode>),
}

pub struct TreeletPlan {
    pub root: TreeletNode,
}

/// Recursively splits `subtree_refs` (by index) along the centroid-bounds
/// dominant axis, binning into `bin_count` buckets and sweeping prefix/suffix
/// sums to find the plane minimizing `area(left)*count(left) +
/// area(right)*count(right)`. Falls back to a median count split whenever the
/// centroid spread is degenerate (all entries share a centroid on the
/// dominant axis) or the binned sweep finds no interior split.
pub fn build_binned_sah(subtree_refs: &[ChildRecord], bin_count: usize) -> TreeletPlan {
    let mut indices: Vec<usize> = (0..subtree_refs.len()).collect();
    let root = build_node(&mut indices, subtree_refs, bin_count.max(1));
    TreeletPlan { root }
}

fn build_node(indices: &mut [usize], refs: &[ChildRecord], bin_count: usize) -> TreeletNode {
    if indices.len() == 1 {
        return TreeletNode::Leaf(indices[0]);
    }

    let centroid_bounds = indices.iter().fold(Aabb::EMPTY, |mut acc, &i| {
        acc.extend(&Aabb::from_point(refs[i].aabb().centroid()));
        acc
    });
    let axis = centroid_bounds.dominant_axis();
    let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];

    if !(extent > 0.0) {
        return median_split(indices, refs, bin_count);
    }

    let bin_of = |i: usize| -> usize {
        let c = refs[i].aabb().centroid()[axis];
        let t = (c - centroid_bounds.min[axis]) / extent;
        ((t * bin_count as f32) as usize).min(bin_count - 1)
    };

    let mut bin_bounds = vec![Aabb::EMPTY; bin_count];
    let mut bin_count_of = vec![0u32; bin_count];
    for &i in indices.iter() {
        let b = bin_of(i);
        bin_bounds[b].extend(&refs[i].aabb());
        bin_count_of[b] += 1;
    }

    // Prefix sweep left-to-right, suffix sweep right-to-left, pick the
    // interior boundary minimizing surface-area-weighted cost.
    let mut prefix_bounds = vec![Aabb::EMPTY; bin_count];
    let mut prefix_count = vec![0u32; bin_count];
    let mut running_bounds = Aabb::EMPTY;
    let mut running_count = 0u32;
    for b in 0..bin_count {
        running_bounds.extend(&bin_bounds[b]);
        running_count += bin_count_of[b];
        prefix_bounds[b] = running_bounds;
        prefix_count[b] = running_count;
    }

    let mut suffix_bounds = vec![Aabb::EMPTY; bin_count];
    let mut suffix_count = vec![0u32; bin_count];
    let mut running_bounds = Aabb::EMPTY;
    let mut running_count = 0u32;
    for b in (0..bin_count).rev() {
        running_bounds.extend(&bin_bounds[b]);
        running_count += bin_count_of[b];
        suffix_bounds[b] = running_bounds;
        suffix_count[b] = running_count;
    }

    let mut best_split: Option<usize> = None;
    let mut best_cost = f32::INFINITY;
    for split in 0..bin_count - 1 {
        let left_count = prefix_count[split];
        let right_count = suffix_count[split + 1];
        if left_count == 0 || right_count == 0 {
            continue;
        }
        let cost = prefix_bounds[split].bounds_metric() * left_count as f32
            + suffix_bounds[split + 1].bounds_metric() * right_count as f32;
        if cost < best_cost {
            best_cost = cost;
            best_split = Some(split);
        }
    }

    let Some(split) = best_split else {
        return median_split(indices, refs, bin_count);
    };

    indices.sort_by_key(|&i| bin_of(i));
    let split_pos = indices.partition_point(|&i| bin_of(i) <= split);
    if split_pos == 0 || split_pos == indices.len() {
        return median_split(indices, refs, bin_count);
    }

    let (left, right) = indices.split_at_mut(split_pos);
    TreeletNode::Split(
        Box::new(build_node(left, refs, bin_count)),
        Box::new(build_node(right, refs, bin_count)),
    )
}

fn median_split(indices: &mut [usize], refs: &[ChildRecord], bin_count: usize) -> TreeletNode {
    indices.sort_by(|&a, &b| {
        refs[a]
            .aabb()
            .centroid()[0]
            .partial_cmp(&refs[b].aabb().centroid()[0])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mid = indices.len() / 2;
    let (left, right) = indices.split_at_mut(mid);
    TreeletNode::Split(
        Box::new(build_node(left, refs, bin_count)),
        Box::new(build_node(right, refs, bin_count)),
    )
}

/// Writes `plan` back into the node slots `reclaimed_slots` (taken from the
/// matching [`collapse_subtree`] call), restoring AABBs, leaf counts, and parent
/// back-references. `parent` and `index_in_parent` describe where the
/// treelet root (the first reclaimed slot, always `node_index` from
/// [`collapse_subtree`]) sits in the wider tree.
///
/// Returns the [`ChildRecord`] the caller should store in `parent`'s child
/// slot (it may differ in AABB/leaf-count from before, and `index` always
/// equals `reclaimed_slots[0]` since the treelet root never moves).
pub fn write_treelet(
    tree: &Tree,
    subtree_refs: &[ChildRecord],
    plan: &TreeletPlan,
    reclaimed_slots: &[NodeIndex],
    parent: Option<NodeIndex>,
    index_in_parent: u8,
) -> ChildRecord {
    let mut cursor = SlotCursor {
        slots: reclaimed_slots,
        next: 0,
    };

    let root_slot = reclaimed_slots[0];
    let record = write_node(tree, subtree_refs, &plan.root, &mut cursor, parent, index_in_parent);

    debug_assert_eq!(
        record.node_index(),
        Some(root_slot),
        "the treelet root must be written back into its original slot"
    );

    record
}

struct SlotCursor<'a> {
    slots: &'a [NodeIndex],
    next: usize,
}

impl SlotCursor<'_> {
    fn take(&mut self) -> NodeIndex {
        let slot = self.slots[self.next];
        self.next += 1;
        slot
    }
}

/// Recursively materializes `node`, writing exactly one [`Node`]/[`Metanode`]
/// pair per [`TreeletNode::Split`] (never for a [`TreeletNode::Leaf`], which
/// just hands back the original subtree-ref unchanged) and returning the
/// [`ChildRecord`] its own parent should hold.
fn write_node(
    tree: &Tree,
    subtree_refs: &[ChildRecord],
    node: &TreeletNode,
    cursor: &mut SlotCursor,
    parent: Option<NodeIndex>,
    index_in_parent: u8,
) -> ChildRecord {
    match node {
        TreeletNode::Leaf(i) => subtree_refs[*i],
        TreeletNode::Split(left, right) => {
            let slot = cursor.take();

            let left_record = write_node(tree, subtree_refs, left, cursor, Some(slot), 0);
            let right_record = write_node(tree, subtree_refs, right, cursor, Some(slot), 1);

            let aabb = left_record.aabb().union(&right_record.aabb());
            let leaf_count = left_record.leaf_count + right_record.leaf_count;

            // SAFETY: `slot` was reclaimed from this treelet's subtree by
            // `collapse_subtree` and is exclusively owned by the refine
            // worker writing this treelet.
            unsafe {
                *tree.node_mut(slot) = Node::new(left_record, right_record);
            }
            tree.metanode(slot).set_parent(parent, index_in_parent);

            for (i, child) in [left_record, right_record].into_iter().enumerate() {
                if let Some(child_index) = child.node_index() {
                    tree.metanode(child_index).set_parent(Some(slot), i as u8);
                }
            }

            ChildRecord::internal(slot, aabb, leaf_count)
        }
    }
}
