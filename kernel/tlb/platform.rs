//! Hooks into the rest of the kernel.
//!
//! The shootdown core does not know how to raise an IPI or mask interrupts;
//! the architecture layer registers a [`Platform`] for that. This keeps the
//! dependency pointing from `arch` to `tlb` and never the other way.

use crate::manager::TlbManager;
use crate::CpuId;

pub trait Platform: Send + Sync {
    /// Raise the TLB shootdown IPI on `target`.
    ///
    /// The target's handler must call [`TlbManager::handle_shootdown_ipi`]
    /// with its own CPU id. Delivery may happen before this returns.
    fn send_shootdown_ipi(&self, tlb: &TlbManager, target: CpuId);

    /// Disable interrupts on the executing CPU, returning whether they were
    /// enabled.
    fn irq_save(&self) -> bool;

    /// Re-enable interrupts if `was_enabled`.
    fn irq_restore(&self, was_enabled: bool);

    fn preempt_disable(&self);

    fn preempt_enable(&self);
}

/// Interrupts off for the guard's lifetime.
pub struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        let was_enabled = platform.irq_save();
        Self {
            platform,
            was_enabled,
        }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.platform.irq_restore(self.was_enabled);
    }
}

/// Preemption off for the guard's lifetime: the caller stays on its CPU.
pub struct PreemptGuard<'a> {
    platform: &'a dyn Platform,
}

impl<'a> PreemptGuard<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        platform.preempt_disable();
        Self { platform }
    }
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        self.platform.preempt_enable();
    }
}
