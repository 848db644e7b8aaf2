//! Node/metanode storage for the dynamic binary AABB tree.
//!
//! `Tree` owns two parallel, index-addressed arrays (`nodes`, `metanodes`) —
//! the same "weak integer back-reference instead of an owned object graph"
//! shape the teacher uses for tree coordinates, just without the coordinate
//! system: a BVH's internal structure is built by insertion/refinement, not
//! derived from a fixed address space, so nodes are addressed by `NodeIndex`
//! rather than by `(x, y)`.

mod cache_optimize;
mod refit_walk;

pub use cache_optimize::incremental_cache_optimize_thread_safe;
pub use refit_walk::{refit_and_mark, refit_and_measure};

use crate::cell::RacyCell;
use crate::geometry::Aabb;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};

/// Index of a node slot in [`Tree::nodes`] / [`Tree::metanodes`].
pub type NodeIndex = u32;

/// Identifier of a leaf, independent of the tree's own indexing.
pub type LeafId = u32;

/// Encode a node index as a negative number so it can share a field with a
/// leaf id: `encode(i) = -1 - i`. Used for the child-record `index` field and
/// for the refit-roots sign-encoding scheme (spec §4.2).
pub fn encode_leaf(leaf_id: LeafId) -> i32 {
    -1 - leaf_id as i32
}

/// Inverse of [`encode_leaf`] — also self-inverse, so it is used for both the
/// child-record leaf encoding and the refit-roots "use `RefitAndMeasure`"
/// sign encoding: `decode(n) = -1 - n`.
pub fn decode_sign(n: i32) -> i32 {
    -1 - n
}

/// One of a [`Node`]'s two children: either a pointer to another internal
/// node, or a leaf, plus the AABB and leaf count of the subtree it roots.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub min: [f32; 3],
    pub max: [f32; 3],
    /// Non-negative: index of an internal node in [`Tree::nodes`].
    /// Negative: `-(index + 1)` is the leaf id.
    pub index: i32,
    pub leaf_count: u32,
}

impl ChildRecord {
    pub fn leaf(leaf_id: LeafId, aabb: Aabb) -> Self {
        ChildRecord {
            min: aabb.min,
            max: aabb.max,
            index: encode_leaf(leaf_id),
            leaf_count: 1,
        }
    }

    pub fn internal(node_index: NodeIndex, aabb: Aabb, leaf_count: u32) -> Self {
        ChildRecord {
            min: aabb.min,
            max: aabb.max,
            index: node_index as i32,
            leaf_count,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.index < 0
    }

    pub fn leaf_id(&self) -> Option<LeafId> {
        self.is_leaf().then(|| decode_sign(self.index) as LeafId)
    }

    pub fn node_index(&self) -> Option<NodeIndex> {
        (!self.is_leaf()).then_some(self.index as NodeIndex)
    }

    pub fn aabb(&self) -> Aabb {
        Aabb {
            min: self.min,
            max: self.max,
        }
    }

    pub fn set_aabb(&mut self, aabb: Aabb) {
        self.min = aabb.min;
        self.max = aabb.max;
    }
}

/// An internal node: exactly two children, stored contiguously so that
/// "child A plus an offset yields child B" (spec §3).
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub children: [ChildRecord; 2],
}

impl Node {
    pub fn new(left: ChildRecord, right: ChildRecord) -> Self {
        Node {
            children: [left, right],
        }
    }

    /// AABB formed by the union of both children — what the node's *parent*
    /// should have on record for this node.
    pub fn own_aabb(&self) -> Aabb {
        self.children[0].aabb().union(&self.children[1].aabb())
    }

    pub fn own_leaf_count(&self) -> u32 {
        self.children[0].leaf_count + self.children[1].leaf_count
    }
}

/// Per-node bookkeeping, parallel to [`Tree::nodes`] by index.
///
/// `refine_flag` is one field doing three disjoint jobs across the pass (spec
/// §9 "Repurposed atomic field"): a wavefront fan-in counter during
/// collection/refit, then (after the main thread clears it) an "is
/// refinement target" boolean between target-select and refine. It must be
/// `0` outside the pass (spec §3 invariant) — [`Tree::scrub_refine_flags`]
/// restores that after an aborted pass (spec §7/§9).
#[derive(Debug, Serialize, Deserialize)]
pub struct Metanode {
    data: RacyCell<MetanodeData>,
    #[serde(
        serialize_with = "serialize_atomic_i32",
        deserialize_with = "deserialize_atomic_i32"
    )]
    pub refine_flag: AtomicI32,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
struct MetanodeData {
    parent: i32,
    index_in_parent: u8,
    local_cost_change: f32,
}

impl Metanode {
    pub fn root() -> Self {
        Metanode {
            data: RacyCell::new(MetanodeData {
                parent: -1,
                index_in_parent: 0,
                local_cost_change: 0.0,
            }),
            refine_flag: AtomicI32::new(0),
        }
    }

    pub fn child(parent: NodeIndex, index_in_parent: u8) -> Self {
        Metanode {
            data: RacyCell::new(MetanodeData {
                parent: parent as i32,
                index_in_parent,
                local_cost_change: 0.0,
            }),
            refine_flag: AtomicI32::new(0),
        }
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        let p = self.data.get().parent;
        (p >= 0).then_some(p as NodeIndex)
    }

    pub fn index_in_parent(&self) -> u8 {
        self.data.get().index_in_parent
    }

    pub fn local_cost_change(&self) -> f32 {
        self.data.get().local_cost_change
    }

    pub fn set_local_cost_change(&self, value: f32) {
        // SAFETY: the refit fan-in barrier guarantees exactly one worker
        // writes a given metanode's data between the moment its refine_flag
        // decrements to zero and the moment it climbs past this node.
        unsafe { self.data.get_mut().local_cost_change = value };
    }

    pub fn add_local_cost_change(&self, delta: f32) {
        self.set_local_cost_change(self.local_cost_change() + delta);
    }

    /// Used by refine/cache-optimize when a node's slot is repacked or
    /// swapped: the parent back-reference and sibling side must be patched
    /// to match the new location.
    pub fn set_parent(&self, parent: Option<NodeIndex>, index_in_parent: u8) {
        unsafe {
            let data = self.data.get_mut();
            data.parent = parent.map(|p| p as i32).unwrap_or(-1);
            data.index_in_parent = index_in_parent;
        }
    }

    /// Exchanges `self`'s and `other`'s parent/index-in-parent/cost-change
    /// data in place, used by cache-optimize when two node slots trade
    /// contents and so must trade identities too.
    ///
    /// # Safety
    /// Caller must hold exclusive access to both `self`'s and `other`'s slots
    /// (cache-optimize's per-slot claim bits).
    pub(crate) fn swap_data_with(&self, other: &Metanode) {
        unsafe {
            std::mem::swap(self.data.get_mut(), other.data.get_mut());
        }
    }
}

impl PartialEq for Metanode {
    fn eq(&self, other: &Self) -> bool {
        self.data.get() == other.data.get()
            && self.refine_flag.load(Ordering::Relaxed) == other.refine_flag.load(Ordering::Relaxed)
    }
}

fn serialize_atomic_i32<S: serde::Serializer>(
    value: &AtomicI32,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i32(value.load(Ordering::Relaxed))
}

fn deserialize_atomic_i32<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<AtomicI32, D::Error> {
    Ok(AtomicI32::new(i32::deserialize(deserializer)?))
}

/// The dynamic binary AABB tree.
///
/// `nodes[0]` is the root whenever `node_count() > 0` (spec §4.1). Leaves are
/// not stored in `nodes`/`metanodes` at all — they live in whatever external
/// store the host (broadphase) keeps; this crate only ever sees their AABBs
/// through the [`ChildRecord`]s that reference them.
#[derive(Debug, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<RacyCell<Node>>,
    metanodes: Vec<Metanode>,
    leaf_count: u32,
}

impl Tree {
    pub fn new(nodes: Vec<Node>, metanodes: Vec<Metanode>, leaf_count: u32) -> Self {
        assert_eq!(
            nodes.len(),
            metanodes.len(),
            "node and metanode arrays must be the same length"
        );
        Tree {
            nodes: nodes.into_iter().map(RacyCell::new).collect(),
            metanodes,
            leaf_count,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    pub const ROOT: NodeIndex = 0;

    pub fn has_root(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        self.nodes[index as usize].get()
    }

    pub fn metanode(&self, index: NodeIndex) -> &Metanode {
        &self.metanodes[index as usize]
    }

    /// # Safety
    /// See [`crate::cell::RacyCell`]'s safety contract: caller must hold the
    /// exclusive right to mutate this node slot under the refit/refine/
    /// cache-optimize protocol.
    pub unsafe fn node_mut(&self, index: NodeIndex) -> &mut Node {
        self.nodes[index as usize].get_mut()
    }

    /// Sets every `refine_flag` back to `0`. Required before the next pass
    /// after a pass aborts partway through a worker dispatch (spec §7/§9).
    pub fn scrub_refine_flags(&self) {
        for metanode in &self.metanodes {
            metanode.refine_flag.store(0, Ordering::SeqCst);
        }
    }

    /// Debug-only invariant check: every `refine_flag` must be zero outside
    /// the pass (spec §3, §8 property 2).
    pub fn debug_assert_flags_clear(&self) {
        debug_assert!(
            self.metanodes
                .iter()
                .all(|m| m.refine_flag.load(Ordering::SeqCst) == 0),
            "refine_flag must be 0 on every node outside the pass; a prior pass left dirty state"
        );
    }

    pub fn root_aabb(&self) -> Aabb {
        self.node(Self::ROOT).own_aabb()
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.leaf_count == other.leaf_count
            && self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a.get() == b.get())
            && self.metanodes == other.metanodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Aabb;

    fn aabb(min: [f32; 3], max: [f32; 3]) -> Aabb {
        Aabb { min, max }
    }

    #[test]
    fn leaf_encoding_round_trips() {
        for id in [0u32, 1, 41, 1_000_000] {
            let encoded = encode_leaf(id);
            assert!(encoded < 0);
            assert_eq!(decode_sign(encoded) as u32, id);
        }
    }

    #[test]
    fn child_record_leaf_and_internal_are_distinguishable() {
        let leaf = ChildRecord::leaf(7, aabb([0.0; 3], [1.0; 3]));
        assert!(leaf.is_leaf());
        assert_eq!(leaf.leaf_id(), Some(7));
        assert_eq!(leaf.node_index(), None);

        let internal = ChildRecord::internal(3, aabb([0.0; 3], [1.0; 3]), 5);
        assert!(!internal.is_leaf());
        assert_eq!(internal.node_index(), Some(3));
        assert_eq!(internal.leaf_id(), None);
    }

    #[test]
    fn node_own_aabb_is_union_of_children() {
        let left = ChildRecord::leaf(0, aabb([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]));
        let right = ChildRecord::leaf(1, aabb([2.0, 2.0, 2.0], [3.0, 3.0, 3.0]));
        let node = Node::new(left, right);
        let union = node.own_aabb();
        assert_eq!(union.min, [0.0, 0.0, 0.0]);
        assert_eq!(union.max, [3.0, 3.0, 3.0]);
        assert_eq!(node.own_leaf_count(), 2);
    }

    #[test]
    fn scrub_clears_dirty_flags() {
        let left = ChildRecord::leaf(0, aabb([0.0; 3], [1.0; 3]));
        let right = ChildRecord::leaf(1, aabb([0.0; 3], [1.0; 3]));
        let tree = Tree::new(vec![Node::new(left, right)], vec![Metanode::root()], 2);

        tree.metanode(0).refine_flag.store(3, Ordering::SeqCst);
        tree.scrub_refine_flags();
        assert_eq!(tree.metanode(0).refine_flag.load(Ordering::SeqCst), 0);
    }
}
