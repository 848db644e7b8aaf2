// Copyright ⓒ 2023 SilverSixpence
// Licensed under the MIT license
// (see LICENSE or <http://opensource.org/licenses/MIT>) All files in the project carrying such
// notice may not be copied, modified, or distributed except according to those terms.

//! # Parallel refit/refine/cache-optimize pass for a dynamic bounding-volume hierarchy
//!
//! This crate implements the per-frame maintenance pass for a dynamic binary
//! AABB tree used as a broadphase in a physics/collision engine: given a
//! [`Tree`] whose leaves have already moved (the engine's job, not this
//! crate's), it refits every ancestor AABB bottom-up, opportunistically
//! rebuilds the worst local regions with a binned SAH treelet rebuild, and
//! incrementally improves the tree's memory layout — all without allocating
//! inside the parallel hot loops, and all through a buffer pool and a worker
//! dispatcher the caller injects rather than anything global.
//!
//! ## What is contained in this code
//!
//! The pass is three dispatches, each a full barrier over the previous one
//! (see [`refit_and_refine`]):
//!
//! 1. **refit-and-mark**: claim refit-roots off an atomic cursor, refit each
//!    subtree bottom-up, and climb the shared spine above it via a lock-free
//!    atomic fan-in (the crate's one genuinely tricky piece of concurrency).
//! 2. **refine**: rebuild the chosen refinement targets from scratch with a
//!    binned surface-area-heuristic treelet builder ([`mod@sah`]).
//! 3. **cache-optimize**: incrementally improve node layout within a rotating
//!    window of the flat node array.
//!
//! Every allocation the pass needs is drawn from an injected [`pool::BufferPool`];
//! every thread it spawns comes from an injected [`dispatch::WorkerDispatcher`] —
//! both capabilities rather than globals, so the pass stays unit-testable with
//! deterministic single-threaded stand-ins ([`dispatch::SequentialDispatcher`],
//! [`dispatch::ReversedDispatcher`]).
//!
//! ## Still to be done
//!
//! See `DESIGN.md` for the grounding ledger, the Open Question resolutions
//! (the two tuning formulas and the cache-optimize rotation schedule), and the
//! accepted-risk caveat around `maximum_subtrees` relative to tree depth.
//!
//! ## How this code can be used
//!
//! ```
//! use bvh_refit::{
//!     dispatch::SequentialDispatcher, pool::VecPool, sah::build_bulk, Aabb,
//!     TuningConfig, WorkerCount,
//! };
//!
//! fn main() {
//!     let leaves: Vec<(u32, Aabb)> = (0..8)
//!         .map(|i| {
//!             let x = i as f32;
//!             (i, Aabb { min: [x, 0.0, 0.0], max: [x + 1.0, 1.0, 1.0] })
//!         })
//!         .collect();
//!
//!     let tree = build_bulk(&leaves);
//!
//!     let worker_count = WorkerCount::from(2);
//!     let pool = VecPool::new(worker_count);
//!     let dispatcher = SequentialDispatcher::new(worker_count);
//!     let tuning = TuningConfig::from_node_count(tree.node_count() as u32);
//!
//!     bvh_refit::refit_and_refine(&tree, &pool, &dispatcher, 0, tuning).unwrap();
//! }
//! ```

pub mod dispatch;
pub mod errors;
pub mod geometry;
pub mod pool;
pub mod sah;
pub mod tuning;
pub mod worker_count;

mod cell;
mod collect;
mod refit;

pub mod tree;

pub use errors::RefitError;
pub use geometry::Aabb;
pub use refit::refit_and_refine;
pub use tree::{ChildRecord, LeafId, Metanode, Node, NodeIndex, Tree};
pub use tuning::TuningConfig;
pub use worker_count::{WorkerCount, WorkerCountError};

/// Test fixtures and assertion macros shared by this crate's unit tests and
/// `tests/scenarios.rs`. Built for `cfg(test)` and also exposed under the
/// `test-support` feature so an integration-test crate — which only ever
/// links the public API — can reach it too.
#[cfg(any(test, feature = "test-support"))]
pub mod testing_utils;
