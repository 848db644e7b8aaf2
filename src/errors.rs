//! Error types for the refit/refine/cache-optimize pass.
//!
//! The pass is total under valid preconditions (spec §7): the only recoverable
//! failure mode is a buffer pool declining to grow a scratch allocation. A
//! duplicate refinement target (the stride walk sampling the same candidate
//! twice, or coinciding with the forced-included root) is handled by
//! self-correcting idempotence in `refit::mark_as_target` rather than treated
//! as an error. Non-zero `refine_flag` at pass start is a prior-frame bug and
//! is reported with `debug_assert!` at the call site (`Tree::
//! debug_assert_flags_clear`) rather than as a variant here, the same way the
//! teacher's builder treats index/arity violations as `assert!`/`panic!`
//! rather than as `TreeBuildError` variants.

use displaydoc::Display;
use thiserror::Error;

/// Error returned by [`crate::refit_and_refine`].
#[derive(Debug, Display, Error)]
pub enum RefitError {
    /// buffer pool failed to allocate scratch for the {phase} phase
    PoolExhausted { phase: &'static str },
}
