//! Hardware capability flags.

use bitflags::bitflags;

bitflags! {
    /// Translation-cache features of the processor.
    ///
    /// Missing features are not errors: the shootdown core picks a coarser
    /// strategy that is slower but still correct.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Tagged TLB entries (PCID). Without it every switch is a full flush.
        const ASID_TAGGING = 1 << 0;
        /// Single-page invalidation (INVLPG). Without it ranges become full flushes.
        const PAGE_INVALIDATE = 1 << 1;
        /// Invalidation by tag without loading it (INVPCID).
        const CONTEXT_INVALIDATE = 1 << 2;
        /// Global kernel pages (CR4.PGE).
        const GLOBAL_PAGES = 1 << 3;
        /// Running under a hypervisor that may offer a flush service.
        const HYPERVISOR = 1 << 4;
    }
}

impl Capabilities {
    /// Drop combinations the protocol cannot use safely.
    ///
    /// Tags without global pages would leave kernel translations cached under
    /// tags that are never flushed again, so tagging requires `GLOBAL_PAGES`.
    pub fn sanitized(self) -> Self {
        let mut caps = self;
        if !caps.contains(Self::GLOBAL_PAGES) {
            caps.remove(Self::ASID_TAGGING);
        }
        caps
    }

    /// Whether address spaces get their own hardware tag.
    #[inline]
    pub fn tagging(self) -> bool {
        self.contains(Self::ASID_TAGGING)
    }

    /// Whether individual pages can be invalidated.
    #[inline]
    pub fn per_page(self) -> bool {
        self.contains(Self::PAGE_INVALIDATE)
    }

    /// Query CPUID on the executing processor.
    ///
    /// - PCID: CPUID.01H:ECX[17]
    /// - hypervisor present: CPUID.01H:ECX[31]
    /// - PGE: CPUID.01H:EDX[13]
    /// - INVPCID: CPUID.(EAX=07H, ECX=0):EBX[10]
    ///
    /// INVLPG exists on every x86_64 processor.
    #[cfg(target_arch = "x86_64")]
    pub fn probe() -> Self {
        use core::arch::x86_64::__cpuid_count;

        #[allow(unused_unsafe)]
        let (leaf1, leaf7) = unsafe { (__cpuid_count(1, 0), __cpuid_count(7, 0)) };

        let mut caps = Self::PAGE_INVALIDATE;
        if leaf1.ecx & (1 << 17) != 0 {
            caps |= Self::ASID_TAGGING;
        }
        if leaf1.ecx & (1 << 31) != 0 {
            caps |= Self::HYPERVISOR;
        }
        if leaf1.edx & (1 << 13) != 0 {
            caps |= Self::GLOBAL_PAGES;
        }
        if leaf7.ebx & (1 << 10) != 0 {
            caps |= Self::CONTEXT_INVALIDATE;
        }
        caps.sanitized()
    }
}
