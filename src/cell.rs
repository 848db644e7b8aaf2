//! A `Sync` cell used to give multiple worker threads shared access to a
//! single flat `Vec` of tree data, where exclusivity of any individual slot
//! is guaranteed by the refit/refine work-partitioning protocol rather than by
//! the borrow checker.
//!
//! This mirrors, at a smaller grain, the way the teacher's multi-threaded
//! builder hands the same `Arc<DashMap<..>>` to every spawned thread and
//! relies on each thread only ever inserting disjoint coordinates
//! (`binary_tree/tree_builder/multi_threaded.rs`) — the difference here is
//! that the BVH's node/metanode arrays are flat, index-addressed, and mutated
//! in place rather than grown, so a hash map's own internal synchronization
//! would be pure overhead; a raw per-slot cell is the natural analogue.
//!
//! # Safety contract
//!
//! Every caller of [`RacyCell::get_mut`] must be able to point to the
//! specific rule (fan-in barrier, disjoint refit-root subtree, disjoint
//! refinement target, disjoint cache-optimize task range) that makes this the
//! only thread touching this slot right now. There is no runtime check; a
//! violation is a silent data race, not a panic.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cell::UnsafeCell;
use std::fmt;

pub(crate) struct RacyCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for RacyCell<T> {}

impl<T> RacyCell<T> {
    pub(crate) fn new(value: T) -> Self {
        RacyCell(UnsafeCell::new(value))
    }

    pub(crate) fn get(&self) -> &T {
        unsafe { &*self.0.get() }
    }

    /// # Safety
    /// See the module-level safety contract.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self) -> &mut T {
        &mut *self.0.get()
    }

    pub(crate) fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

impl<T: Clone> RacyCell<T> {
    pub(crate) fn snapshot(&self) -> T {
        self.get().clone()
    }
}

impl<T: fmt::Debug> fmt::Debug for RacyCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}

impl<T: PartialEq> PartialEq for RacyCell<T> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

/// Serializes as plain `T` — the cell itself carries no state of its own, only
/// the single-owner discipline documented above, which a (de)serialized tree
/// is not mid-pass for anyway.
impl<T: Serialize> Serialize for RacyCell<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for RacyCell<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(RacyCell::new(T::deserialize(deserializer)?))
    }
}
