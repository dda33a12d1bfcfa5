//! TLB Operations Library
//!
//! Low-level translation-cache primitives shared by the shootdown core (`tlb`)
//! and the architecture layer. The crate has no dependency on either of them,
//! so both can use it without creating a cycle.
//!
//! # Layers
//!
//! | Item | Role |
//! |------|------|
//! | [`Capabilities`] | What the processor offers: tags, INVLPG, INVPCID, PGE, hypervisor |
//! | [`LocalTlb`] | Invalidation on the executing CPU |
//! | [`X86Tlb`] | `LocalTlb` backed by real x86_64 instructions |
//! | [`Transport`] | How remote CPUs are reached: [`Direct`] or [`Virtualized`] |
//!
//! The transport is picked once with [`select`] and never changes afterwards.
//!
//! # Hardware tags
//!
//! CR3 carries a 12-bit tag (PCID). Dynamic ASID slot `n` is loaded as tag
//! `n + 1`; tag 0 belongs to code that is not tag-aware, so a PCID-unaware
//! save/restore of CR3 can never corrupt a real slot.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod caps;
mod local;
mod transport;
#[cfg(target_arch = "x86_64")]
mod x86;

pub use caps::Capabilities;
pub use local::{hw_tag, LocalTlb};
pub use transport::{select, Direct, Hypervisor, RemoteScope, Transport, TransportKind, Virtualized};
#[cfg(target_arch = "x86_64")]
pub use x86::X86Tlb;

/// Logical CPU index (0 = BSP).
pub type CpuId = usize;

/// Base page shift.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size; huge pages are flushed with the same granularity.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// `end` sentinel meaning "the whole address space".
pub const TLB_FLUSH_ALL: u64 = u64::MAX;

/// Width of the tag field in CR3.
pub const CR3_HW_ASID_BITS: u32 = 12;

/// Largest dynamic ASID: tags are zero-based and tag 0 is reserved.
pub const MAX_ASID_AVAILABLE: u16 = (1 << CR3_HW_ASID_BITS) - 2;

/// CR3 bit 63: keep the new tag's cached translations on load.
pub const CR3_NOFLUSH: u64 = 1 << 63;
