//! Batched unmap.
//!
//! Reclaim unmaps pages from many address spaces before freeing any of
//! them. Instead of one shootdown per unmap, each unmap only bumps the
//! generation and records the CPUs that may cache the old translations; a
//! single dispatch then flushes them all right before the frames are freed.

use crate::address_space::AddressSpace;
use crate::cpumask::CpuSet;

#[derive(Debug, Default)]
pub struct TlbBatch {
    cpus: CpuSet,
    pending: usize,
}

impl TlbBatch {
    pub const fn new() -> Self {
        Self {
            cpus: CpuSet::EMPTY,
            pending: 0,
        }
    }

    /// Publish a page-table change of `mm` and remember who must flush it.
    pub(crate) fn add(&mut self, mm: &AddressSpace) {
        mm.bump_generation();
        self.cpus = self.cpus.union(mm.affinity_set());
        self.pending += 1;
    }

    /// CPUs accumulated so far.
    #[inline]
    pub fn cpus(&self) -> CpuSet {
        self.cpus
    }

    /// Number of `add` calls since the last commit.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }
}
