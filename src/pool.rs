//! Buffer pool (spec §5/§6): the memory-allocation capability is injected,
//! just like the dispatcher (spec §9 "Dispatcher injection"), so callers can
//! supply an arena/slab allocator of their own. [`VecPool`] is the reference
//! implementation: plain `Vec`s recycled across frames, using
//! [`Vec::try_reserve`] so allocation failure is a real `Result` rather than
//! an abort, matching spec §7's "allocation failure from a pool" error kind.

use crate::cell::RacyCell;
use crate::errors::RefitError;
use crate::tree::{ChildRecord, NodeIndex};
use crate::worker_count::WorkerCount;

/// Cross-frame lists owned by the main thread (spec §5): refit-roots,
/// refinement-targets, and cache-optimize start indices. Also the source of
/// each worker's thread-local pool.
///
/// `Sync` because a single `&dyn BufferPool` (or `&P`) is shared into every
/// worker's refine-dispatch closure (spec §6) to reach `thread_pool`.
pub trait BufferPool: Sync {
    fn take_refit_roots(&self, capacity: usize) -> Result<Vec<i32>, RefitError>;
    fn return_refit_roots(&self, buf: Vec<i32>);

    fn take_refinement_targets(&self, capacity: usize) -> Result<Vec<NodeIndex>, RefitError>;
    fn return_refinement_targets(&self, buf: Vec<NodeIndex>);

    fn take_cache_optimize_starts(&self, capacity: usize) -> Result<Vec<u32>, RefitError>;
    fn return_cache_optimize_starts(&self, buf: Vec<u32>);

    /// `getThreadMemoryPool(workerIndex)` (spec §6).
    fn thread_pool(&self, worker_index: u32) -> &dyn ThreadBufferPool;
}

/// A single worker's scratch: its candidate list (grown during refit-and-mark)
/// and, during refine, its subtree-ref and reclaimed-slot buffers. "Thread
/// pools are used only by their owning worker" (spec §6) — there is no
/// synchronization here beyond that discipline.
pub trait ThreadBufferPool {
    fn take_node_index_vec(&self, capacity: usize) -> Result<Vec<NodeIndex>, RefitError>;
    fn return_node_index_vec(&self, buf: Vec<NodeIndex>);

    fn take_child_record_vec(&self, capacity: usize) -> Result<Vec<ChildRecord>, RefitError>;
    fn return_child_record_vec(&self, buf: Vec<ChildRecord>);
}

/// `Vec`-backed [`BufferPool`]. Every list lives behind a [`RacyCell`]: the
/// three main-thread lists are, by construction, only ever touched from the
/// main thread (never inside a worker dispatch closure); each thread slot is,
/// by construction, only ever touched by the worker index it belongs to.
/// Neither needs a lock, only the documented exclusive-access discipline
/// `RacyCell` already carries elsewhere in this crate.
pub struct VecPool {
    refit_roots: RacyCell<Vec<i32>>,
    refinement_targets: RacyCell<Vec<NodeIndex>>,
    cache_optimize_starts: RacyCell<Vec<u32>>,
    threads: Vec<VecThreadBufferPool>,
}

impl VecPool {
    pub fn new(worker_count: WorkerCount) -> Self {
        VecPool {
            refit_roots: RacyCell::new(Vec::new()),
            refinement_targets: RacyCell::new(Vec::new()),
            cache_optimize_starts: RacyCell::new(Vec::new()),
            threads: (0..worker_count.as_usize())
                .map(|_| VecThreadBufferPool::new())
                .collect(),
        }
    }
}

impl BufferPool for VecPool {
    fn take_refit_roots(&self, capacity: usize) -> Result<Vec<i32>, RefitError> {
        take_vec(&self.refit_roots, capacity, "wavefront collection")
    }

    fn return_refit_roots(&self, buf: Vec<i32>) {
        return_vec(&self.refit_roots, buf);
    }

    fn take_refinement_targets(&self, capacity: usize) -> Result<Vec<NodeIndex>, RefitError> {
        take_vec(&self.refinement_targets, capacity, "target select")
    }

    fn return_refinement_targets(&self, buf: Vec<NodeIndex>) {
        return_vec(&self.refinement_targets, buf);
    }

    fn take_cache_optimize_starts(&self, capacity: usize) -> Result<Vec<u32>, RefitError> {
        take_vec(&self.cache_optimize_starts, capacity, "cache optimize setup")
    }

    fn return_cache_optimize_starts(&self, buf: Vec<u32>) {
        return_vec(&self.cache_optimize_starts, buf);
    }

    fn thread_pool(&self, worker_index: u32) -> &dyn ThreadBufferPool {
        &self.threads[worker_index as usize]
    }
}

struct VecThreadBufferPool {
    node_index_scratch: RacyCell<Vec<NodeIndex>>,
    child_record_scratch: RacyCell<Vec<ChildRecord>>,
}

impl VecThreadBufferPool {
    fn new() -> Self {
        VecThreadBufferPool {
            node_index_scratch: RacyCell::new(Vec::new()),
            child_record_scratch: RacyCell::new(Vec::new()),
        }
    }
}

impl ThreadBufferPool for VecThreadBufferPool {
    fn take_node_index_vec(&self, capacity: usize) -> Result<Vec<NodeIndex>, RefitError> {
        take_vec(&self.node_index_scratch, capacity, "refit-and-mark candidate scratch")
    }

    fn return_node_index_vec(&self, buf: Vec<NodeIndex>) {
        return_vec(&self.node_index_scratch, buf);
    }

    fn take_child_record_vec(&self, capacity: usize) -> Result<Vec<ChildRecord>, RefitError> {
        take_vec(&self.child_record_scratch, capacity, "refine treelet scratch")
    }

    fn return_child_record_vec(&self, buf: Vec<ChildRecord>) {
        return_vec(&self.child_record_scratch, buf);
    }
}

fn take_vec<T>(
    cell: &RacyCell<Vec<T>>,
    capacity: usize,
    phase: &'static str,
) -> Result<Vec<T>, RefitError> {
    // SAFETY: see this module's struct-level documentation — each cell has a
    // single owner by construction.
    let mut buf = std::mem::take(unsafe { cell.get_mut() });
    let additional = capacity.saturating_sub(buf.capacity());
    buf.try_reserve(additional)
        .map_err(|_| RefitError::PoolExhausted { phase })?;
    Ok(buf)
}

fn return_vec<T>(cell: &RacyCell<Vec<T>>, mut buf: Vec<T>) {
    buf.clear();
    // SAFETY: see this module's struct-level documentation.
    unsafe {
        *cell.get_mut() = buf;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_return_round_trips_capacity() {
        let pool = VecPool::new(WorkerCount::from(2));
        let buf = pool.take_refit_roots(16).expect("allocation should succeed");
        assert!(buf.capacity() >= 16);
        pool.return_refit_roots(buf);

        let buf_again = pool.take_refit_roots(8).expect("reused buffer should still succeed");
        assert!(buf_again.capacity() >= 16, "capacity should be retained across frames");
    }

    #[test]
    fn thread_pools_are_independent_per_worker() {
        let pool = VecPool::new(WorkerCount::from(2));
        let a = pool.thread_pool(0).take_node_index_vec(4).unwrap();
        let b = pool.thread_pool(1).take_node_index_vec(4).unwrap();
        pool.thread_pool(0).return_node_index_vec(a);
        pool.thread_pool(1).return_node_index_vec(b);
    }

    #[test]
    fn returned_buffers_are_cleared() {
        let pool = VecPool::new(WorkerCount::from(1));
        let mut buf = pool.take_refinement_targets(4).unwrap();
        buf.push(3);
        pool.return_refinement_targets(buf);
        let buf = pool.take_refinement_targets(0).unwrap();
        assert!(buf.is_empty());
    }
}
