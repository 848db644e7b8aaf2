/// Check 2 errors are the same.
/// https://stackoverflow.com/a/65618681
macro_rules! assert_err {
    ($expression:expr, $($pattern:tt)+) => {
        match $expression {
            $($pattern)+ => (),
            ref e => panic!("expected `{}` but got `{:?}`", stringify!($($pattern)+), e),
        }
    }
}
pub(crate) use assert_err;

/// Same as [assert_err] but without needing debug
/// https://stackoverflow.com/a/65618681
macro_rules! assert_err_simple {
        ($expression:expr, $($pattern:tt)+) => {
            match $expression {
                $($pattern)+ => (),
                _ => panic!("expected a specific error but did not get it"),
            }
        }
    }
pub(crate) use assert_err_simple;

pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .is_test(true)
        .try_init();
}

use crate::geometry::Aabb;
use crate::sah::build_bulk;
use crate::tree::{LeafId, NodeIndex, Tree};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// `leaf_count` unit-cube AABBs placed on an evenly spaced grid along the x
/// axis, built bottom-up via [`crate::sah::build_bulk`]. Deterministic: same
/// `leaf_count` always yields the same tree shape.
pub fn grid_tree(leaf_count: u32) -> Tree {
    let leaves = grid_leaves(leaf_count);
    build_bulk(&leaves)
}

pub fn grid_leaves(leaf_count: u32) -> Vec<(LeafId, Aabb)> {
    (0..leaf_count)
        .map(|i| {
            let x = i as f32 * 2.0;
            (i, Aabb { min: [x, 0.0, 0.0], max: [x + 1.0, 1.0, 1.0] })
        })
        .collect()
}

/// `leaf_count` unit-cube AABBs scattered within a cube of side `spread`,
/// seeded from `seed` so a test can reproduce a failure. Exercises the SAH
/// builder's centroid-sort/binning path on non-degenerate input, unlike
/// [`grid_leaves`]'s single dominant axis.
pub fn scattered_leaves(leaf_count: u32, spread: f32, seed: u64) -> Vec<(LeafId, Aabb)> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..leaf_count)
        .map(|i| {
            let center = [
                rng.gen_range(0.0..spread),
                rng.gen_range(0.0..spread),
                rng.gen_range(0.0..spread),
            ];
            (
                i,
                Aabb {
                    min: center,
                    max: [center[0] + 1.0, center[1] + 1.0, center[2] + 1.0],
                },
            )
        })
        .collect()
}

/// Same as [`scattered_leaves`] but already assembled into a [`Tree`].
pub fn scattered_tree(leaf_count: u32, spread: f32, seed: u64) -> Tree {
    build_bulk(&scattered_leaves(leaf_count, spread, seed))
}

/// Nudges every leaf's AABB in `leaves` by a small deterministic offset
/// derived from `seed`, simulating one frame's worth of motion ahead of a
/// [`crate::refit_and_refine`] call.
pub fn jitter_leaves(leaves: &mut [(LeafId, Aabb)], seed: u64) {
    let mut rng = SmallRng::seed_from_u64(seed);
    for (_, aabb) in leaves.iter_mut() {
        let offset = [
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
        ];
        for axis in 0..3 {
            aabb.min[axis] += offset[axis];
            aabb.max[axis] += offset[axis];
        }
    }
}

/// Finds the `(parent_node, index_in_parent)` slot holding `leaf_id`'s
/// [`crate::tree::ChildRecord`] by linear scan. `Tree` keeps no leaf-id index
/// (leaves live in the host's own store, spec §3) so this is test-only: a
/// real caller already knows which slot moved.
pub fn find_leaf_slot(tree: &Tree, leaf_id: LeafId) -> Option<(NodeIndex, usize)> {
    for index in 0..tree.node_count() as NodeIndex {
        let node = tree.node(index);
        for (slot, child) in node.children.iter().enumerate() {
            if child.leaf_id() == Some(leaf_id) {
                return Some((index, slot));
            }
        }
    }
    None
}

/// Writes `new_aabb` into `leaf_id`'s slot in `tree`, simulating the host
/// engine moving that leaf ahead of a [`crate::refit_and_refine`] call.
///
/// # Panics
/// Panics if `leaf_id` is not present in `tree`.
pub fn move_leaf(tree: &Tree, leaf_id: LeafId, new_aabb: Aabb) {
    let (node_index, slot) = find_leaf_slot(tree, leaf_id).expect("leaf_id must be present in tree");
    // SAFETY: test-only helper invoked between passes, never concurrently
    // with a `refit_and_refine` call.
    unsafe {
        tree.node_mut(node_index).children[slot].set_aabb(new_aabb);
    }
}
