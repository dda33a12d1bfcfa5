//! Address-space handle seen by the TLB layer.
//!
//! The mm lifecycle owns address spaces; this layer only reads their identity
//! and generation and keeps the affinity set current on context switch.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpumask::{AtomicCpuSet, CpuSet};
use crate::generation::Generation;
use crate::CpuId;

/// Identity of an address space. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContextId(u64);

impl ContextId {
    /// No address space (empty slot).
    pub const NONE: ContextId = ContextId(0);
    /// The kernel-only address space.
    pub const KERNEL: ContextId = ContextId(1);

    fn allocate() -> Self {
        static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(2);
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "ctx(none)"),
            Self::KERNEL => write!(f, "ctx(kernel)"),
            ContextId(id) => write!(f, "ctx({})", id),
        }
    }
}

/// One set of mappings and the CPUs that may cache them.
pub struct AddressSpace {
    id: ContextId,
    root: u64,
    generation: Generation,
    affinity: AtomicCpuSet,
}

impl AddressSpace {
    /// New user address space whose top-level page table lives at `root`.
    pub fn new(root: u64) -> Self {
        Self::with_id(ContextId::allocate(), root)
    }

    /// The kernel-only address space loaded at CPU bring-up.
    pub fn kernel(root: u64) -> Self {
        Self::with_id(ContextId::KERNEL, root)
    }

    fn with_id(id: ContextId, root: u64) -> Self {
        Self {
            id,
            root,
            generation: Generation::new(),
            affinity: AtomicCpuSet::default(),
        }
    }

    #[inline]
    pub fn context_id(&self) -> ContextId {
        self.id
    }

    /// Physical address of the top-level page table.
    #[inline]
    pub fn root(&self) -> u64 {
        self.root
    }

    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.id == ContextId::KERNEL
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    /// Publish a page-table change. See [`Generation::bump`].
    #[inline]
    pub fn bump_generation(&self) -> u64 {
        self.generation.bump()
    }

    /// CPUs that may hold translations for this address space.
    #[inline]
    pub fn affinity_set(&self) -> CpuSet {
        self.affinity.load()
    }

    pub(crate) fn add_cpu(&self, cpu: CpuId) {
        self.affinity.insert(cpu);
    }

    pub(crate) fn remove_cpu(&self, cpu: CpuId) {
        self.affinity.remove(cpu);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("root", &format_args!("{:#x}", self.root))
            .field("generation", &self.generation())
            .field("affinity", &self.affinity_set())
            .finish()
    }
}
