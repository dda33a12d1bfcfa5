//! Flush requests.

use crate::address_space::ContextId;
use crate::{PAGE_SIZE, TLB_FLUSH_ALL};

/// Which translations a request covers on each receiving CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    /// One address space; CPUs that do not have it loaded ignore the request.
    Context(ContextId),
    /// Whatever user address space each receiver has loaded, caught up to
    /// its current generation.
    Loaded,
    /// Every address space, kernel translations included.
    Global,
}

/// One invalidation, built per event and dropped once acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest {
    pub target: FlushTarget,
    /// Page-aligned start; 0 for full flushes.
    pub start: u64,
    /// Page-aligned exclusive end, or `TLB_FLUSH_ALL`.
    pub end: u64,
    /// Generation receivers should reach. Only meaningful for `Context`.
    pub target_generation: u64,
}

/// Page-aligned `[start, end)`, or `None` when the range must become a full
/// flush.
fn normalize_range(start: u64, end: u64, ceiling: u64, per_page: bool) -> Option<(u64, u64)> {
    if !per_page || end == TLB_FLUSH_ALL || end <= start {
        return None;
    }
    let start = start & !(PAGE_SIZE - 1);
    // Overflow: full flush
    let end = end.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);
    let pages = (end - start) / PAGE_SIZE;
    if pages > ceiling {
        None
    } else {
        Some((start, end))
    }
}

impl FlushRequest {
    /// Whole-address-space flush of `ctx` up to `generation`.
    pub fn address_space(ctx: ContextId, generation: u64) -> Self {
        Self {
            target: FlushTarget::Context(ctx),
            start: 0,
            end: TLB_FLUSH_ALL,
            target_generation: generation,
        }
    }

    /// Flush `[start, end)` of `ctx` up to `generation`.
    ///
    /// Ranges wider than `ceiling` pages, ranges that overflow when widened to
    /// page boundaries, and every range when `per_page` is false become
    /// whole-address-space flushes.
    pub fn range(
        ctx: ContextId,
        start: u64,
        end: u64,
        generation: u64,
        ceiling: u64,
        per_page: bool,
    ) -> Self {
        match normalize_range(start, end, ceiling, per_page) {
            Some((start, end)) => Self {
                target: FlushTarget::Context(ctx),
                start,
                end,
                target_generation: generation,
            },
            None => Self::address_space(ctx, generation),
        }
    }

    /// Everything on every CPU.
    pub fn global() -> Self {
        Self {
            target: FlushTarget::Global,
            start: 0,
            end: TLB_FLUSH_ALL,
            target_generation: 0,
        }
    }

    /// Kernel pages `[start, end)` on every CPU, with the same widening rules
    /// as [`FlushRequest::range`].
    pub fn kernel_range(start: u64, end: u64, ceiling: u64, per_page: bool) -> Self {
        match normalize_range(start, end, ceiling, per_page) {
            Some((start, end)) => Self {
                target: FlushTarget::Global,
                start,
                end,
                target_generation: 0,
            },
            None => Self::global(),
        }
    }

    /// Batched-unmap flush of each receiver's loaded address space.
    pub fn loaded() -> Self {
        Self {
            target: FlushTarget::Loaded,
            start: 0,
            end: TLB_FLUSH_ALL,
            target_generation: 0,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.end == TLB_FLUSH_ALL
    }

    /// Pages covered by a ranged request; 0 for a full one.
    pub fn page_count(&self) -> u64 {
        if self.is_full() {
            0
        } else {
            (self.end - self.start) / PAGE_SIZE
        }
    }

    /// Page addresses of a ranged request.
    pub fn pages(&self) -> impl Iterator<Item = u64> {
        let start = self.start;
        (0..self.page_count()).map(move |i| start + i * PAGE_SIZE)
    }
}
