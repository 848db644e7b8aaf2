//! Top-level per-frame pass (spec §4/§5): wavefront collection, the
//! refit-and-mark dispatch with its atomic fan-in climb to the root, target
//! selection, the refine dispatch, and the cache-optimize dispatch — in that
//! order, each a full barrier over the one before it (spec §5 "three
//! dispatches, each a barrier over the previous one").
//!
//! [`refit_and_refine`] is the crate's sole entry point. Every allocation it
//! needs comes from the injected [`BufferPool`]; every thread it uses comes
//! from the injected [`WorkerDispatcher`] — mirroring the teacher's
//! multi-threaded builder, which likewise takes its thread count and storage
//! as parameters rather than reaching for a global (`binary_tree/tree_builder
//! /multi_threaded.rs`).

use crate::cell::RacyCell;
use crate::collect;
use crate::dispatch::WorkerDispatcher;
use crate::errors::RefitError;
use crate::pool::BufferPool;
use crate::sah::{build_binned_sah, collapse_subtree, write_treelet, SAH_BIN_COUNT};
use crate::tree::{
    decode_sign, incremental_cache_optimize_thread_safe, refit_and_mark, refit_and_measure,
    ChildRecord, NodeIndex, Tree,
};
use crate::tuning::{get_cache_optimize_tuning, get_refine_tuning, TuningConfig};
use log::debug;
use logging_timer::stime;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Runs one full refit/refine/cache-optimize pass over `tree`.
///
/// No-op (besides the debug invariant check) for a tree with two or fewer
/// leaves: such a tree has at most one internal node whose two children are
/// both leaves, nothing below it to wavefront-collect, and no treelet worth
/// rebuilding (spec §4.0 edge case).
///
/// `frame_index` seeds the two tuning formulas' deterministic rotation (spec
/// §4.4/§4.6/§8 property 5) — the same `frame_index` with the same tree state
/// and worker count reproduces the same refinement targets and cache-optimize
/// windows regardless of dispatch order.
#[stime("debug", "refit_and_refine::{}")]
pub fn refit_and_refine<D: WorkerDispatcher, P: BufferPool>(
    tree: &Tree,
    pool: &P,
    dispatcher: &D,
    frame_index: u64,
    tuning: TuningConfig,
) -> Result<(), RefitError> {
    tree.debug_assert_flags_clear();

    if tree.leaf_count() <= 2 {
        debug!("frame {}: tree has <= 2 leaves, skipping pass", frame_index);
        return Ok(());
    }

    let worker_count = dispatcher.worker_count().as_u32();

    let (refit_cost_change, refinement_candidates) =
        refit_and_mark_phase(tree, pool, dispatcher, worker_count, &tuning)?;
    debug!(
        "frame {}: refit-and-mark done, refit_cost_change={}",
        frame_index, refit_cost_change
    );

    let refinement_targets =
        select_refinement_targets(tree, pool, frame_index, &tuning, refit_cost_change, &refinement_candidates)?;
    debug!("frame {}: {} refinement targets selected", frame_index, refinement_targets.len());

    let refine_result = refine_phase(tree, pool, dispatcher, &tuning, &refinement_targets);
    pool.return_refinement_targets(refinement_targets);
    refine_result?;

    cache_optimize_phase(tree, pool, dispatcher, frame_index, &tuning, refit_cost_change, worker_count)?;

    Ok(())
}

/// Per-worker wavefront candidate lists, wrapped so the refit-and-mark
/// dispatch closure (`Fn(u32) + Sync`, no `&mut` capture allowed) can still
/// grow its own list exclusively.
type CandidateLists = Vec<RacyCell<Vec<NodeIndex>>>;

fn refit_and_mark_phase<D: WorkerDispatcher, P: BufferPool>(
    tree: &Tree,
    pool: &P,
    dispatcher: &D,
    worker_count: u32,
    tuning: &TuningConfig,
) -> Result<(f32, Vec<NodeIndex>), RefitError> {
    let candidate_estimate = (tree.leaf_count() / tuning.refinement_leaf_count_threshold.max(1)) as usize + 1;

    let mut raw_candidates: Vec<Vec<NodeIndex>> = Vec::with_capacity(worker_count as usize);
    for w in 0..worker_count {
        raw_candidates.push(pool.thread_pool(w).take_node_index_vec(candidate_estimate)?);
    }

    let refit_root_estimate = (tree.leaf_count() / tuning.refinement_leaf_count_threshold.max(1)).max(worker_count) as usize;
    let mut refit_roots = pool.take_refit_roots(refit_root_estimate)?;

    collect::collect_refit_roots(
        tree,
        worker_count,
        tuning.refinement_leaf_count_threshold,
        &mut refit_roots,
        &mut raw_candidates,
    );

    let candidates: CandidateLists = raw_candidates.into_iter().map(RacyCell::new).collect();

    let refit_cursor = AtomicU32::new(0);
    let refit_cost_change_bits = AtomicU32::new(0u32);
    let leaf_threshold = tuning.refinement_leaf_count_threshold;

    dispatcher.dispatch(|worker_index| {
        // SAFETY: each worker only ever touches its own slot (indexed by the
        // `worker_index` the dispatcher hands this closure), established by
        // this being the single place `candidates` is written during the
        // refit-and-mark dispatch.
        let worker_candidates = unsafe { candidates[worker_index as usize].get_mut() };

        loop {
            let i = refit_cursor.fetch_add(1, Ordering::Relaxed);
            if i as usize >= refit_roots.len() {
                break;
            }

            let entry = refit_roots[i as usize];
            let (node_index, measure_only) = if entry < 0 {
                (decode_sign(entry) as NodeIndex, true)
            } else {
                (entry as NodeIndex, false)
            };

            let parent_index = tree
                .metanode(node_index)
                .parent()
                .expect("a refit-root is never the tree root itself");
            let index_in_parent = tree.metanode(node_index).index_in_parent();

            // SAFETY: refit-roots partition the tree into disjoint subtrees —
            // no two claimed entries ever share a node.
            let child = unsafe { &mut tree.node_mut(parent_index).children[index_in_parent as usize] };

            let cost_change = if measure_only {
                refit_and_measure(tree, child)
            } else {
                refit_and_mark(tree, child, leaf_threshold, worker_candidates)
            };

            tree.metanode(node_index).set_local_cost_change(cost_change);

            if let Some(total) = climb_from(tree, node_index) {
                publish_refit_cost_change(tree, total, &refit_cost_change_bits);
            }
        }
    });

    pool.return_refit_roots(refit_roots);

    // Which refit-root each worker claims is a race on `refit_cursor`, so a
    // candidate's position in `candidates[worker_index]` is not a function of
    // `frame_index`/`worker_count` alone (spec §8 property 5). Flattening and
    // sorting by node index before target selection gives a canonical order
    // that depends only on the candidate *set*, which the claim race doesn't
    // affect: every refit-root's subtree is visited by exactly one worker
    // regardless of which one, so the same nodes become candidates either way.
    let mut merged_candidates: Vec<NodeIndex> = Vec::new();
    for cell in &candidates {
        merged_candidates.extend_from_slice(cell.get());
    }
    merged_candidates.sort_unstable();
    return_candidate_buffers(pool, candidates);

    let refit_cost_change = f32::from_bits(refit_cost_change_bits.load(Ordering::Acquire));
    Ok((refit_cost_change, merged_candidates))
}

/// Atomic decrement-to-zero fan-in from `node_index`'s parent up toward the
/// root (spec §4.1 "fan-in barrier"). Returns `Some(total_cost_change)` only
/// for the single worker that happens to be the last arrival at the root;
/// every other worker (including every other arrival along the way) gets
/// `None` and moves on to its next claimed refit-root.
fn climb_from(tree: &Tree, mut node_index: NodeIndex) -> Option<f32> {
    loop {
        let Some(parent_index) = tree.metanode(node_index).parent() else {
            return Some(tree.metanode(node_index).local_cost_change());
        };

        let remaining = tree.metanode(parent_index).refine_flag.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining != 0 {
            return None;
        }

        // SAFETY: this worker is the sole last arrival at `parent_index`,
        // established by the fetch_sub above reaching zero exactly once.
        let parent_node = tree.node(parent_index);
        let mut delta = 0.0f32;
        for child in &parent_node.children {
            if let Some(idx) = child.node_index() {
                delta += tree.metanode(idx).local_cost_change();
            }
        }

        let new_aabb = parent_node.own_aabb();
        if let Some(grandparent) = tree.metanode(parent_index).parent() {
            let index_in_gp = tree.metanode(parent_index).index_in_parent();
            // SAFETY: exclusive right to `grandparent`'s slot follows from
            // being the last arrival at `parent_index`, its child.
            let record = unsafe { &mut tree.node_mut(grandparent).children[index_in_gp as usize] };
            let pre = record.aabb().bounds_metric();
            record.set_aabb(new_aabb);
            delta += new_aabb.bounds_metric() - pre;
        }

        tree.metanode(parent_index).set_local_cost_change(delta);
        node_index = parent_index;
    }
}

fn publish_refit_cost_change(tree: &Tree, total_cost_change: f32, out: &AtomicU32) {
    let root_metric = tree.root_aabb().bounds_metric();
    let value = if root_metric > 1e-9 {
        (total_cost_change / root_metric).max(0.0)
    } else {
        0.0
    };
    out.store(value.to_bits(), Ordering::Release);
}

fn return_candidate_buffers<P: BufferPool>(pool: &P, candidates: CandidateLists) {
    for (w, cell) in candidates.into_iter().enumerate() {
        pool.thread_pool(w as u32).return_node_index_vec(cell.into_inner());
    }
}

/// Single-threaded selection of which wavefront candidates become refinement
/// targets this frame (spec §4.4), plus the forced inclusion of the root
/// itself — the root is never a wavefront candidate (it has no parent to be
/// one beneath) but still benefits from periodic treelet rebuilding.
fn select_refinement_targets<P: BufferPool>(
    tree: &Tree,
    pool: &P,
    frame_index: u64,
    tuning: &TuningConfig,
    refit_cost_change: f32,
    candidates: &[NodeIndex],
) -> Result<Vec<NodeIndex>, RefitError> {
    let total_candidates = candidates.len();

    let (target_count, period, offset) = get_refine_tuning(
        frame_index,
        total_candidates as u32,
        tuning.refine_aggressiveness_scale,
        refit_cost_change,
    );

    let mut targets = pool.take_refinement_targets(target_count as usize + 1)?;
    targets.clear();

    // Spec §4.4: pick `targetCount - 1` distinct candidates by stride, then
    // force the root in only if the stride didn't already land on it — so the
    // total stays `targetCount` either way.
    if total_candidates > 0 {
        for k in 0..target_count.saturating_sub(1) {
            let pos = (offset as u64 + k as u64 * period as u64) % total_candidates as u64;
            mark_as_target(tree, candidates[pos as usize], &mut targets);
        }
    }

    mark_as_target(tree, Tree::ROOT, &mut targets);

    Ok(targets)
}

/// Marks `node_index` as a refinement target exactly once: `refine_flag`'s
/// previous value of `0` (left there by the refit-and-mark climb, spec §9
/// "repurposed atomic field") becomes the idempotence check, so a candidate
/// sampled twice by the stride walk — or coinciding with the forced root —
/// is silently deduplicated rather than appended twice.
fn mark_as_target(tree: &Tree, node_index: NodeIndex, targets: &mut Vec<NodeIndex>) {
    if tree.metanode(node_index).refine_flag.swap(1, Ordering::SeqCst) == 0 {
        targets.push(node_index);
    }
}

fn refine_phase<D: WorkerDispatcher, P: BufferPool>(
    tree: &Tree,
    pool: &P,
    dispatcher: &D,
    tuning: &TuningConfig,
    targets: &[NodeIndex],
) -> Result<(), RefitError> {
    let refine_cursor = AtomicU32::new(0);
    let abort: Mutex<Option<RefitError>> = Mutex::new(None);
    let max_subtrees = tuning.maximum_subtrees as usize;

    dispatcher.dispatch(|worker_index| {
        if abort.lock().unwrap().is_some() {
            return;
        }

        let worker_pool = pool.thread_pool(worker_index);
        let mut subtree_refs = match worker_pool.take_child_record_vec(max_subtrees) {
            Ok(v) => v,
            Err(e) => {
                *abort.lock().unwrap() = Some(e);
                return;
            }
        };
        let mut reclaimed_slots = match worker_pool.take_node_index_vec(max_subtrees) {
            Ok(v) => v,
            Err(e) => {
                *abort.lock().unwrap() = Some(e);
                worker_pool.return_child_record_vec(subtree_refs);
                return;
            }
        };

        loop {
            if abort.lock().unwrap().is_some() {
                break;
            }
            let i = refine_cursor.fetch_add(1, Ordering::Relaxed);
            if i as usize >= targets.len() {
                break;
            }
            refine_one(tree, targets[i as usize], max_subtrees, &mut subtree_refs, &mut reclaimed_slots);
        }

        worker_pool.return_child_record_vec(subtree_refs);
        worker_pool.return_node_index_vec(reclaimed_slots);
    });

    if let Some(err) = abort.into_inner().unwrap() {
        tree.scrub_refine_flags();
        return Err(err);
    }

    Ok(())
}

/// One target's treelet rebuild (spec §4.5): collapse the widest subtrees
/// under `target` into a flat set, replan with binned SAH, write the result
/// back into the reclaimed slots, then patch `target`'s own `ChildRecord` in
/// its parent (a no-op patch when `target` is the root, which has none).
fn refine_one(
    tree: &Tree,
    target: NodeIndex,
    max_subtrees: usize,
    subtree_refs: &mut Vec<ChildRecord>,
    reclaimed_slots: &mut Vec<NodeIndex>,
) {
    collapse_subtree(tree, target, max_subtrees, subtree_refs, reclaimed_slots);
    let plan = build_binned_sah(subtree_refs, SAH_BIN_COUNT);

    let parent = tree.metanode(target).parent();
    let index_in_parent = tree.metanode(target).index_in_parent();
    let record = write_treelet(tree, subtree_refs, &plan, reclaimed_slots, parent, index_in_parent);

    if let Some(parent_index) = parent {
        // SAFETY: refinement targets are the maximal wavefront candidates
        // plus the root, an antichain under the tree's ancestor order, so no
        // two targets' treelets can write the same parent slot concurrently
        // (see DESIGN.md for the one acknowledged caveat around the root).
        unsafe {
            tree.node_mut(parent_index).children[index_in_parent as usize] = record;
        }
    }

    tree.metanode(target).refine_flag.store(0, Ordering::SeqCst);
}

/// Rotating incremental cache-optimize sweep (spec §4.6). `cacheOptimizationTasks
/// = 2 * workerCount` tasks, each covering `perWorkerCacheOptimizeCount`
/// contiguous node slots. The first task's start is `frameIndex *
/// perWorkerCacheOptimizeCount mod nodeCount`; every later start is the
/// previous one plus `nodeCount / workerCount` (bumped by one for the first
/// `nodeCount mod workerCount` of them, the usual remainder-distribution
/// trick for splitting `nodeCount` into `workerCount` near-equal spans),
/// wrapping mod `nodeCount`. Two full such spans (one per worker's two tasks)
/// is how the rotation covers fresh ground as `frame_index` advances.
fn cache_optimize_phase<D: WorkerDispatcher, P: BufferPool>(
    tree: &Tree,
    pool: &P,
    dispatcher: &D,
    frame_index: u64,
    tuning: &TuningConfig,
    refit_cost_change: f32,
    worker_count: u32,
) -> Result<(), RefitError> {
    let node_count = tree.node_count() as u32;
    if node_count == 0 {
        return Ok(());
    }

    let worker_count = worker_count.max(1);
    let task_count = 2 * worker_count;

    let scaled_worker_factor =
        (0.25 * worker_count as f32).max(1.0) * tuning.cache_optimize_aggressiveness_scale;
    let cache_optimize_count =
        get_cache_optimize_tuning(tuning.maximum_subtrees, refit_cost_change, scaled_worker_factor);
    let per_task_count = (cache_optimize_count / task_count).max(1);

    let base_increment = node_count / worker_count;
    let remainder = node_count % worker_count;

    let mut starts = pool.take_cache_optimize_starts(task_count as usize)?;
    starts.clear();

    let first = (frame_index as u32).wrapping_mul(per_task_count) % node_count;
    starts.push(first);
    let mut current = first;
    for i in 1..task_count {
        let lap_position = (i - 1) % worker_count;
        let increment = base_increment + if lap_position < remainder { 1 } else { 0 };
        current = (current + increment) % node_count;
        starts.push(current);
    }

    // One `AtomicBool` claim bit per node slot (spec §4.6 "safe to call from
    // multiple workers on disjoint index regions"). Allocated fresh before
    // the hot loop begins rather than drawn from the buffer pool — see
    // DESIGN.md for why this one allocation doesn't violate spec §5's "no
    // allocations inside the atomic hot loops".
    let locks: Vec<AtomicBool> = (0..tree.node_count()).map(|_| AtomicBool::new(false)).collect();

    dispatcher.dispatch(|worker_index| {
        for task in [worker_index, worker_index + worker_count] {
            let Some(&start) = starts.get(task as usize) else {
                continue;
            };
            for offset in 0..per_task_count {
                let idx = start + offset;
                if idx >= node_count {
                    break;
                }
                incremental_cache_optimize_thread_safe(tree, &locks, idx);
            }
        }
    });

    pool.return_cache_optimize_starts(starts);
    Ok(())
}
