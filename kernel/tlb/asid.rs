//! Per-CPU ASID slot table.
//!
//! A CPU keeps up to [`TLB_NR_DYN_ASIDS`] address spaces resident in its TLB
//! at once, each under its own hardware tag. Slot `n` is loaded as hardware
//! tag `n + 1` (see [`tlb_ops::hw_tag`]); tag 0 stays reserved for code that
//! does not know about tagging.
//!
//! Each slot remembers which address space owns it and up to which
//! generation the TLB is known to be consistent for it. Slots are handed out
//! round-robin; a reassigned slot starts at [`GEN_UNKNOWN`] and must be fully
//! flushed before use.

use log::debug;

use crate::address_space::ContextId;

/// Number of dynamic ASID slots per CPU.
pub const TLB_NR_DYN_ASIDS: usize = 6;

/// Index into a CPU's slot table.
pub type Asid = u16;

/// Cached generation of a slot whose TLB contents are unknown.
pub const GEN_UNKNOWN: u64 = 0;

/// One ASID slot: `(owning address space, consistent-up-to generation)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsidSlot {
    pub ctx: ContextId,
    pub generation: u64,
}

impl AsidSlot {
    pub const EMPTY: AsidSlot = AsidSlot {
        ctx: ContextId::NONE,
        generation: GEN_UNKNOWN,
    };
}

/// Fixed-capacity slot table with a round-robin cursor.
#[derive(Debug)]
pub struct AsidTable {
    slots: [AsidSlot; TLB_NR_DYN_ASIDS],
    capacity: u16,
    next_asid: u16,
    reassignments: u64,
}

impl AsidTable {
    /// Empty table using the first `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(
            (1..=TLB_NR_DYN_ASIDS).contains(&capacity),
            "ASID table capacity {} out of range",
            capacity
        );
        Self {
            slots: [AsidSlot::EMPTY; TLB_NR_DYN_ASIDS],
            capacity: capacity.clamp(1, TLB_NR_DYN_ASIDS) as u16,
            next_asid: 1,
            reassignments: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bring-up state: slot 0 holds `ctx` at `generation`, the rest are empty.
    pub fn reset(&mut self, ctx: ContextId, generation: u64) {
        self.slots = [AsidSlot::EMPTY; TLB_NR_DYN_ASIDS];
        self.slots[0] = AsidSlot { ctx, generation };
        self.next_asid = 1;
    }

    /// Slot currently owned by `ctx`, if any.
    pub fn find(&self, ctx: ContextId) -> Option<Asid> {
        if ctx.is_none() {
            return None;
        }
        self.slots[..self.capacity()]
            .iter()
            .position(|slot| slot.ctx == ctx)
            .map(|i| i as Asid)
    }

    /// Pick the slot to run `ctx` under.
    ///
    /// Returns `(asid, needs_full_flush)`. A reused slot does not need a full
    /// flush, but the caller must still catch it up from its cached
    /// generation. A reassigned slot has its generation reset to
    /// [`GEN_UNKNOWN`] and must be fully flushed.
    pub fn acquire(&mut self, ctx: ContextId) -> (Asid, bool) {
        debug_assert!(!ctx.is_none(), "ASID requested for no address space");
        if let Some(asid) = self.find(ctx) {
            return (asid, false);
        }

        let mut asid = self.next_asid;
        self.next_asid += 1;
        if asid >= self.capacity {
            asid = 0;
            self.next_asid = 1;
        }

        let victim = self.slots[asid as usize];
        if !victim.ctx.is_none() {
            self.reassignments += 1;
            debug!(
                "ASID {} reassigned: {:?} evicted by {:?}",
                asid, victim.ctx, ctx
            );
        }
        self.slots[asid as usize] = AsidSlot {
            ctx,
            generation: GEN_UNKNOWN,
        };
        (asid, true)
    }

    /// Record that slot `asid` is consistent up to `generation`.
    ///
    /// Monotonic: returns `false` and changes nothing if the slot is already
    /// at or past `generation`.
    pub fn mark_flushed(&mut self, asid: Asid, generation: u64) -> bool {
        let slot = &mut self.slots[self.index(asid)];
        if slot.generation >= generation {
            return false;
        }
        slot.generation = generation;
        true
    }

    #[inline]
    pub fn slot(&self, asid: Asid) -> AsidSlot {
        self.slots[self.index(asid)]
    }

    /// Forget whatever slot `asid` held.
    pub fn invalidate(&mut self, asid: Asid) {
        let i = self.index(asid);
        self.slots[i] = AsidSlot::EMPTY;
    }

    /// Slots handed from one address space to another since bring-up.
    #[inline]
    pub fn reassignments(&self) -> u64 {
        self.reassignments
    }

    #[inline]
    fn index(&self, asid: Asid) -> usize {
        debug_assert!(
            asid < self.capacity,
            "ASID {} out of range (capacity {})",
            asid,
            self.capacity
        );
        asid as usize
    }
}
