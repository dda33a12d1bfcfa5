//! CPU-local invalidation primitives.

use crate::{CpuId, MAX_ASID_AVAILABLE};

/// Invalidation on the executing CPU.
///
/// Every method acts on the processor it runs on; `cpu` names that processor
/// for implementations that account per CPU (hypervisor shims, simulators).
/// Callers hold interrupts disabled around each call.
pub trait LocalTlb: Send + Sync {
    /// Load `root` as the active page-table root under hardware tag `tag`.
    ///
    /// With `flush == false` the tag's cached translations are kept, which is
    /// only meaningful when tagging is enabled.
    fn load_root(&self, cpu: CpuId, root: u64, tag: u16, flush: bool);

    /// Invalidate one page of the currently loaded context.
    fn invalidate_page(&self, cpu: CpuId, addr: u64);

    /// Invalidate every non-global translation cached under `tag`.
    fn invalidate_context(&self, cpu: CpuId, tag: u16);

    /// Invalidate one kernel page, global translation included.
    fn invalidate_kernel_page(&self, cpu: CpuId, addr: u64);

    /// Invalidate every translation under every tag, globals included.
    fn invalidate_all(&self, cpu: CpuId);
}

/// Hardware tag for dynamic ASID slot `asid`.
///
/// Returns 0 when tagging is off: the CPU then has a single implicit context.
#[inline]
pub fn hw_tag(asid: u16, tagging: bool) -> u16 {
    if !tagging {
        debug_assert!(asid == 0, "ASID {} used without tagging support", asid);
        return 0;
    }
    debug_assert!(asid <= MAX_ASID_AVAILABLE, "ASID {} out of range", asid);
    asid + 1
}
