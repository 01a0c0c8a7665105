//! Heap allocation and refcount counters
//!
//! The VM is single-threaded, so these are plain integers bumped on the
//! allocation and refcount paths. A snapshot feeds the `TERN_REPORT`
//! output and the trace-mode balance checks (`num_retains == num_releases
//! + live references` for cycle-free programs; object construction counts
//! as the first retain).

use serde::Serialize;

/// Counters owned by the heap, snapshotted into the VM stats report
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct MemoryCounters {
    /// Pages allocated over the heap's lifetime (pages are never freed
    /// before deinit)
    pub pages_allocated: u64,
    /// Objects handed out by `alloc_object`
    pub objects_allocated: u64,
    /// Objects returned by `free_object`
    pub objects_freed: u64,
    /// Retains, including the initial reference written at construction
    pub num_retains: u64,
    /// Releases of pointer values
    pub num_releases: u64,
    /// Cycle members reclaimed by the cycle-detecting sweep
    pub cycle_roots_freed: u64,
}

impl MemoryCounters {
    /// Objects currently live (allocated minus freed)
    pub fn live_objects(&self) -> u64 {
        self.objects_allocated - self.objects_freed
    }
}
