//! Per-CPU execution state.
//!
//! # State Machine
//!
//! ```text
//! Uninitialized --bring_up--> ActiveKernel
//! ActiveKernel / ActiveUser(A) / LazyUser(A) --switch_mm(B)--> ActiveUser(B)
//! ActiveUser(A) --enter_lazy(defer)--> LazyUser(A)
//! LazyUser(A) --switch_mm(A)--> ActiveUser(A)   (catch-up if A moved on)
//! any --force_kernel--> ActiveKernel            (current tag fully flushed)
//! ```
//!
//! Only the owning CPU (or its own shootdown handler) touches this state, and
//! always with interrupts disabled. Other CPUs only ever look at the affinity
//! sets of address spaces.

use alloc::sync::Arc;
use log::trace;

use crate::address_space::{AddressSpace, ContextId};
use crate::asid::{Asid, AsidSlot, AsidTable};
use crate::request::{FlushRequest, FlushTarget};
use crate::stats::{self, TlbStats};
use crate::{hw_tag, CpuId, LocalTlb};

/// Observable state of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Uninitialized,
    ActiveKernel,
    ActiveUser(ContextId),
    LazyUser(ContextId),
}

/// What a CPU did with one flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The target address space is not loaded here.
    Ignored,
    /// The slot was already at or past the target generation.
    Redundant,
    /// Invalidated page by page.
    Ranged(u64),
    /// Invalidated the whole tag, or everything for a global request.
    Full,
}

/// Hardware and accounting handles used while mutating a CPU's state.
pub(crate) struct LocalOps<'a> {
    pub local: &'a dyn LocalTlb,
    pub tagging: bool,
    pub stats: &'a TlbStats,
}

pub(crate) struct CpuTlbState {
    cpu: CpuId,
    loaded: Option<Arc<AddressSpace>>,
    loaded_asid: Asid,
    is_lazy: bool,
    asids: AsidTable,
}

impl CpuTlbState {
    pub fn new(cpu: CpuId, asid_slots: usize) -> Self {
        Self {
            cpu,
            loaded: None,
            loaded_asid: 0,
            is_lazy: false,
            asids: AsidTable::new(asid_slots),
        }
    }

    pub fn state(&self) -> ExecState {
        match &self.loaded {
            None => ExecState::Uninitialized,
            Some(mm) if mm.is_kernel() => ExecState::ActiveKernel,
            Some(mm) if self.is_lazy => ExecState::LazyUser(mm.context_id()),
            Some(mm) => ExecState::ActiveUser(mm.context_id()),
        }
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn loaded_asid(&self) -> Option<Asid> {
        self.loaded.as_ref().map(|_| self.loaded_asid)
    }

    pub fn slot(&self, asid: Asid) -> AsidSlot {
        self.asids.slot(asid)
    }

    pub fn asid_capacity(&self) -> usize {
        self.asids.capacity()
    }

    /// Cached generation of `ctx`'s slot on this CPU, if it owns one.
    pub fn cached_generation(&self, ctx: ContextId) -> Option<u64> {
        self.asids.find(ctx).map(|asid| self.asids.slot(asid).generation)
    }

    fn loaded_mm(&self) -> &Arc<AddressSpace> {
        match &self.loaded {
            Some(mm) => mm,
            None => panic!("TLB state of CPU {} used before bring-up", self.cpu),
        }
    }

    /// `Uninitialized -> ActiveKernel`.
    pub fn bring_up(&mut self, kernel: &Arc<AddressSpace>, ops: &LocalOps<'_>) {
        assert!(self.loaded.is_none(), "CPU {} brought up twice", self.cpu);
        self.asids.reset(kernel.context_id(), kernel.generation());
        ops.local.load_root(self.cpu, kernel.root(), hw_tag(0, ops.tagging), true);
        stats::inc(&ops.stats.root_loads);
        self.loaded = Some(kernel.clone());
        self.loaded_asid = 0;
        self.is_lazy = false;
    }

    /// Force the kernel address space, then return to `Uninitialized`.
    pub fn tear_down(&mut self, kernel: &Arc<AddressSpace>, ops: &LocalOps<'_>) {
        self.force_kernel(kernel, ops);
        self.loaded = None;
        self.loaded_asid = 0;
        self.is_lazy = false;
    }

    /// Make `next` the active address space.
    pub fn switch_mm(&mut self, next: &Arc<AddressSpace>, ops: &LocalOps<'_>) {
        let cpu = self.cpu;
        let prev = self.loaded_mm().clone();

        if Arc::ptr_eq(&prev, next) {
            let was_lazy = self.is_lazy;
            self.is_lazy = false;
            // Changes may have been published while we were lazy, or by a
            // batch that has not been committed yet.
            let next_gen = next.generation();
            let asid = self.loaded_asid;
            if self.asids.slot(asid).generation < next_gen {
                ops.local.invalidate_context(cpu, hw_tag(asid, ops.tagging));
                self.asids.mark_flushed(asid, next_gen);
                stats::inc(&ops.stats.full_flushes);
                stats::inc(&ops.stats.catch_up_flushes);
                trace!(
                    "cpu {}: {:?} caught up to gen {} (was lazy: {})",
                    cpu,
                    next.context_id(),
                    next_gen,
                    was_lazy
                );
            }
            return;
        }

        // Stop remote flushes for prev, start them for next, and only then
        // read next's generation.
        if !prev.is_kernel() {
            prev.remove_cpu(cpu);
        }
        if !next.is_kernel() {
            next.add_cpu(cpu);
        }
        let next_gen = next.generation();

        let reassignments = self.asids.reassignments();
        let (asid, mut need_flush) = self.asids.acquire(next.context_id());
        if self.asids.reassignments() != reassignments {
            stats::inc(&ops.stats.asid_reassignments);
        }
        if !need_flush && (!ops.tagging || self.asids.slot(asid).generation < next_gen) {
            need_flush = true;
            stats::inc(&ops.stats.catch_up_flushes);
        }

        let tag = hw_tag(asid, ops.tagging);
        ops.local.load_root(cpu, next.root(), tag, need_flush);
        stats::inc(&ops.stats.root_loads);
        if need_flush {
            self.asids.mark_flushed(asid, next_gen);
            stats::inc(&ops.stats.full_flushes);
        }

        trace!(
            "cpu {}: switch {:?} -> {:?} asid {} gen {} flush {}",
            cpu,
            prev.context_id(),
            next.context_id(),
            asid,
            next_gen,
            need_flush
        );

        self.loaded = Some(next.clone());
        self.loaded_asid = asid;
        self.is_lazy = false;
    }

    /// No user task to run: stay lazily in the current address space if
    /// `defer`, otherwise switch to `kernel`.
    pub fn enter_lazy(&mut self, defer: bool, kernel: &Arc<AddressSpace>, ops: &LocalOps<'_>) {
        if self.loaded_mm().is_kernel() {
            return;
        }
        if defer {
            self.is_lazy = true;
        } else {
            self.switch_mm(kernel, ops);
        }
    }

    /// Any state `-> ActiveKernel`, fully flushing the current tag.
    pub fn force_kernel(&mut self, kernel: &Arc<AddressSpace>, ops: &LocalOps<'_>) {
        let cpu = self.cpu;
        let asid = self.loaded_asid;
        let tag = hw_tag(asid, ops.tagging);
        let loaded = self.loaded_mm().clone();

        ops.local.invalidate_context(cpu, tag);
        stats::inc(&ops.stats.full_flushes);

        if loaded.is_kernel() {
            self.asids.mark_flushed(asid, loaded.generation());
            self.is_lazy = false;
            return;
        }
        self.asids.invalidate(asid);
        self.switch_mm(kernel, ops);
    }

    /// Apply `req` to this CPU's TLB and slot table.
    pub fn handle_flush(&mut self, req: &FlushRequest, ops: &LocalOps<'_>) -> FlushOutcome {
        let cpu = self.cpu;
        let mm = self.loaded_mm().clone();
        let asid = self.loaded_asid;
        let tag = hw_tag(asid, ops.tagging);

        match req.target {
            FlushTarget::Global => {
                if req.is_full() {
                    ops.local.invalidate_all(cpu);
                    self.asids.mark_flushed(asid, mm.generation());
                    stats::inc(&ops.stats.full_flushes);
                    FlushOutcome::Full
                } else {
                    for addr in req.pages() {
                        ops.local.invalidate_kernel_page(cpu, addr);
                    }
                    stats::inc(&ops.stats.range_flushes);
                    stats::add(&ops.stats.pages_flushed, req.page_count());
                    FlushOutcome::Ranged(req.page_count())
                }
            }
            FlushTarget::Loaded => {
                if mm.is_kernel() {
                    return FlushOutcome::Ignored;
                }
                let mm_gen = mm.generation();
                if self.asids.slot(asid).generation >= mm_gen {
                    stats::inc(&ops.stats.redundant_requests);
                    return FlushOutcome::Redundant;
                }
                ops.local.invalidate_context(cpu, tag);
                self.asids.mark_flushed(asid, mm_gen);
                stats::inc(&ops.stats.full_flushes);
                FlushOutcome::Full
            }
            FlushTarget::Context(ctx) => {
                if mm.context_id() != ctx {
                    return FlushOutcome::Ignored;
                }
                let local_gen = self.asids.slot(asid).generation;
                if local_gen >= req.target_generation {
                    stats::inc(&ops.stats.redundant_requests);
                    trace!(
                        "cpu {}: {:?} already at gen {} (want {})",
                        cpu,
                        ctx,
                        local_gen,
                        req.target_generation
                    );
                    return FlushOutcome::Redundant;
                }

                // A range only covers the step from target - 1 to target; if
                // this slot is further behind, or another change has been
                // published since, only a full flush is sufficient.
                let mm_gen = mm.generation();
                if !req.is_full()
                    && req.target_generation == local_gen + 1
                    && req.target_generation == mm_gen
                {
                    for addr in req.pages() {
                        ops.local.invalidate_page(cpu, addr);
                    }
                    self.asids.mark_flushed(asid, req.target_generation);
                    stats::inc(&ops.stats.range_flushes);
                    stats::add(&ops.stats.pages_flushed, req.page_count());
                    FlushOutcome::Ranged(req.page_count())
                } else {
                    ops.local.invalidate_context(cpu, tag);
                    self.asids.mark_flushed(asid, mm_gen);
                    stats::inc(&ops.stats.full_flushes);
                    FlushOutcome::Full
                }
            }
        }
    }
}
