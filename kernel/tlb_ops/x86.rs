//! Direct x86_64 implementation of [`LocalTlb`].
//!
//! # INVPCID Types
//!
//! | Type | Name | Used for |
//! |------|------|----------|
//! | 0 | Individual-address | not used: INVLPG covers the loaded tag |
//! | 1 | Single-context | flushing one tag without loading it |
//! | 2 | All-context | not used |
//! | 3 | All-context-global | flushing everything |
//!
//! Without INVPCID a context flush reloads CR3 (only valid for the loaded
//! tag) and a global flush toggles CR4.PGE.

use core::arch::asm;

use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr4, Cr4Flags};
use x86_64::VirtAddr;

use crate::{Capabilities, CpuId, LocalTlb, CR3_NOFLUSH};

const INVPCID_SINGLE_CONTEXT: u64 = 1;
const INVPCID_ALL_GLOBAL: u64 = 3;

/// Tag bits of CR3.
const CR3_TAG_MASK: u64 = 0xFFF;

/// In-memory operand of INVPCID.
#[repr(C, align(16))]
struct InvpcidDesc {
    pcid: u64,
    addr: u64,
}

/// Translation-cache control through privileged x86_64 instructions.
///
/// Must only be used in ring 0 with the capabilities it was built from.
pub struct X86Tlb {
    caps: Capabilities,
}

impl X86Tlb {
    pub const fn new(caps: Capabilities) -> Self {
        Self { caps }
    }

    #[inline]
    fn read_cr3() -> u64 {
        let value: u64;
        // Safety: reading CR3 has no side effects in ring 0.
        unsafe {
            asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }

    #[inline]
    unsafe fn write_cr3(value: u64) {
        asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
    }

    #[inline]
    unsafe fn invpcid(kind: u64, pcid: u16, addr: u64) {
        let desc = InvpcidDesc {
            pcid: pcid as u64,
            addr,
        };
        asm!(
            "invpcid {kind}, [{desc}]",
            kind = in(reg) kind,
            desc = in(reg) &desc,
            options(nostack, preserves_flags),
        );
    }
}

impl LocalTlb for X86Tlb {
    fn load_root(&self, _cpu: CpuId, root: u64, tag: u16, flush: bool) {
        debug_assert!(root & CR3_TAG_MASK == 0, "page-table root {:#x} not page aligned", root);
        debug_assert!(flush || self.caps.tagging(), "NOFLUSH load without PCID");
        let mut cr3 = root | tag as u64;
        if !flush {
            cr3 |= CR3_NOFLUSH;
        }
        // Safety: the caller loads a valid root that maps the running kernel.
        unsafe { Self::write_cr3(cr3) }
    }

    fn invalidate_page(&self, _cpu: CpuId, addr: u64) {
        tlb::flush(VirtAddr::new(addr));
    }

    fn invalidate_context(&self, _cpu: CpuId, tag: u16) {
        if self.caps.contains(Capabilities::CONTEXT_INVALIDATE) {
            // Safety: INVPCID is supported and `tag` fits in 12 bits.
            unsafe { Self::invpcid(INVPCID_SINGLE_CONTEXT, tag, 0) };
            return;
        }
        let cr3 = Self::read_cr3();
        debug_assert_eq!(
            (cr3 & CR3_TAG_MASK) as u16,
            tag,
            "context flush of a tag that is not loaded"
        );
        // Bit 63 never reads back as set, so this reload flushes the loaded tag.
        unsafe { Self::write_cr3(cr3) }
    }

    fn invalidate_kernel_page(&self, _cpu: CpuId, addr: u64) {
        // INVLPG drops global translations for the address as well.
        tlb::flush(VirtAddr::new(addr));
    }

    fn invalidate_all(&self, _cpu: CpuId) {
        if self.caps.contains(Capabilities::CONTEXT_INVALIDATE) {
            // Safety: INVPCID is supported.
            unsafe { Self::invpcid(INVPCID_ALL_GLOBAL, 0, 0) };
        } else if self.caps.contains(Capabilities::GLOBAL_PAGES) {
            let cr4 = Cr4::read();
            // Safety: toggling PGE off and back on only drops cached
            // translations; interrupts are disabled by the caller.
            unsafe {
                Cr4::write(cr4 ^ Cr4Flags::PAGE_GLOBAL);
                Cr4::write(cr4);
            }
        } else {
            // No global pages and no tags: a plain reload flushes everything.
            unsafe { Self::write_cr3(Self::read_cr3()) }
        }
    }
}
