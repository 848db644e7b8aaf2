//! Tuning knobs and the two formulas spec §9 leaves as an implementation
//! choice (`GetRefineTuning`, `GetCacheOptimizeTuning`), resolved concretely
//! here as pure, deterministic functions of their inputs — see DESIGN.md for
//! the reasoning.

use serde::{Deserialize, Serialize};

/// Knobs threaded through a single [`crate::refit_and_refine`] call. Mirrors
/// the teacher's builder-style config (`binary_tree/tree_builder.rs`'s
/// `TreeBuilder`), deriving sensible defaults from `node_count` rather than
/// requiring every caller to hand-tune every field.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Leaf-count cap on a single `BinnedRefine` treelet (spec §4.1/§4.4).
    pub maximum_subtrees: u32,
    /// Wavefront/candidate cutoff (spec §4.2/§4.3).
    pub refinement_leaf_count_threshold: u32,
    /// Scales `GetRefineTuning`'s target count (spec §4.4/§6).
    pub refine_aggressiveness_scale: f32,
    /// Scales `GetCacheOptimizeTuning`'s task size (spec §4.6/§6).
    pub cache_optimize_aggressiveness_scale: f32,
}

impl TuningConfig {
    /// Defaults scaled off node count, the way the teacher's `TreeBuilder`
    /// derives `store_depth` from `height` when the caller doesn't supply one.
    pub fn from_node_count(node_count: u32) -> Self {
        TuningConfig {
            maximum_subtrees: node_count.clamp(4, 256),
            refinement_leaf_count_threshold: node_count.clamp(2, 64) / 8 + 2,
            refine_aggressiveness_scale: 1.0,
            cache_optimize_aggressiveness_scale: 1.0,
        }
    }
}

/// `GetRefineTuning(frameIndex, refinementCandidatesCount, aggressivenessScale,
/// refitCostChange) -> (targetCount, period, offset)` (spec §4.4).
///
/// `targetCount` grows with both `refitCostChange` (a volatile tree gets more
/// refinement) and `aggressivenessScale`; `period` is the stride that samples
/// roughly `targetCount` candidates out of `refinementCandidatesCount`;
/// `offset` rotates which candidates are chosen from frame to frame using
/// nothing but `frameIndex`, so independent runs of the same frame agree.
pub fn get_refine_tuning(
    frame_index: u64,
    refinement_candidates_count: u32,
    aggressiveness_scale: f32,
    refit_cost_change: f32,
) -> (u32, u32, u32) {
    if refinement_candidates_count == 0 {
        return (0, 1, 0);
    }

    let volatility = 1.0 + refit_cost_change.max(0.0) * 8.0;
    let fraction = (0.05 * aggressiveness_scale.max(0.0) * volatility).clamp(0.0, 1.0);
    let target_count = ((refinement_candidates_count as f32 * fraction).ceil() as u32)
        .clamp(1, refinement_candidates_count);

    let period = (refinement_candidates_count / target_count).max(1);

    // A fixed irrational-ish stride (`frameIndex * tau` truncated) decorrelates
    // consecutive frames' offsets without needing any RNG state.
    const ROTATION: f64 = 2.399_963_229_728_653; // golden-angle-ish constant
    let offset = (((frame_index as f64) * ROTATION) % period as f64) as u32;

    (target_count, period, offset)
}

/// `GetCacheOptimizeTuning(maximumSubtrees, refitCostChange,
/// scaledWorkerFactor) -> cacheOptimizeCount` (spec §4.6): more volatile
/// trees, and more workers available to absorb the cost, do more
/// cache-optimize work per frame.
pub fn get_cache_optimize_tuning(
    maximum_subtrees: u32,
    refit_cost_change: f32,
    scaled_worker_factor: f32,
) -> u32 {
    let volatility = 1.0 + refit_cost_change.max(0.0) * 4.0;
    let base = maximum_subtrees.max(1) as f32;
    (base * scaled_worker_factor.max(0.0) * volatility).round() as u32
}
