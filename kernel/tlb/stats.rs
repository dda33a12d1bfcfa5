//! TLB statistics (for debugging/profiling).
//!
//! Counters are atomics with relaxed ordering; a snapshot is not a consistent
//! cut across counters.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TlbStats {
    /// Whole-tag or whole-TLB invalidations executed on any CPU.
    pub(crate) full_flushes: AtomicU64,
    /// Ranged invalidations executed on any CPU.
    pub(crate) range_flushes: AtomicU64,
    /// Pages invalidated by ranged invalidations.
    pub(crate) pages_flushed: AtomicU64,
    /// Global requests dispatched.
    pub(crate) global_flushes: AtomicU64,
    pub(crate) root_loads: AtomicU64,
    pub(crate) asid_reassignments: AtomicU64,
    /// Flushes done while switching in to bring a slot current.
    pub(crate) catch_up_flushes: AtomicU64,
    /// Requests dropped because the slot was already current.
    pub(crate) redundant_requests: AtomicU64,
    pub(crate) ipis_sent: AtomicU64,
    pub(crate) ipi_retries: AtomicU64,
    /// Remote flushes completed by the hypervisor.
    pub(crate) hypervisor_flushes: AtomicU64,
}

/// Point-in-time copy of [`TlbStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStatsSnapshot {
    pub full_flushes: u64,
    pub range_flushes: u64,
    pub pages_flushed: u64,
    pub global_flushes: u64,
    pub root_loads: u64,
    pub asid_reassignments: u64,
    pub catch_up_flushes: u64,
    pub redundant_requests: u64,
    pub ipis_sent: u64,
    pub ipi_retries: u64,
    pub hypervisor_flushes: u64,
}

#[inline]
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl TlbStats {
    pub fn snapshot(&self) -> TlbStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TlbStatsSnapshot {
            full_flushes: load(&self.full_flushes),
            range_flushes: load(&self.range_flushes),
            pages_flushed: load(&self.pages_flushed),
            global_flushes: load(&self.global_flushes),
            root_loads: load(&self.root_loads),
            asid_reassignments: load(&self.asid_reassignments),
            catch_up_flushes: load(&self.catch_up_flushes),
            redundant_requests: load(&self.redundant_requests),
            ipis_sent: load(&self.ipis_sent),
            ipi_retries: load(&self.ipi_retries),
            hypervisor_flushes: load(&self.hypervisor_flushes),
        }
    }
}
