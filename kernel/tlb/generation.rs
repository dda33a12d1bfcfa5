//! Per-address-space TLB generation counter.
//!
//! # Memory Ordering
//!
//! - Writer: page-table stores, then [`Generation::bump`] (SeqCst fetch-add),
//!   then a read of the affinity set.
//! - Switching CPU: joins the affinity set, then reads the generation.
//!
//! Both sides use SeqCst, so at least one of them observes the other: either
//! the writer sees the CPU in the set and sends it a shootdown, or the CPU
//! sees the new generation and flushes while switching in.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic version of an address space's page tables.
#[derive(Debug)]
pub struct Generation(AtomicU64);

impl Generation {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current generation.
    #[inline]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Advance the generation and return the new value.
    ///
    /// Call only after every page-table store of the change is done.
    #[inline]
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}
