//! The TLB manager: per-CPU state, configuration and transport in one place.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use log::{debug, info};
use spin::Mutex;

use crate::address_space::{AddressSpace, ContextId};
use crate::asid::{Asid, AsidSlot};
use crate::config::{ConfigError, TlbConfig};
use crate::cpu_state::{CpuTlbState, ExecState, LocalOps};
use crate::cpumask::{AtomicCpuSet, CpuSet};
use crate::platform::{IrqGuard, Platform};
use crate::shootdown::Shootdown;
use crate::stats::{TlbStats, TlbStatsSnapshot};
use crate::{Capabilities, CpuId, Hypervisor, LocalTlb, Transport, TransportKind};

/// Hardware hooks handed to [`TlbManager::new`].
pub struct Hardware {
    /// CPU-local invalidation primitives.
    pub local: Arc<dyn LocalTlb>,
    /// Hypervisor flush service, if one was registered.
    pub hypervisor: Option<Arc<dyn Hypervisor>>,
    pub platform: Arc<dyn Platform>,
}

/// Everything one CPU owns.
pub(crate) struct PerCpuTlb {
    pub(crate) state: Mutex<CpuTlbState>,
    /// Pending shootdowns posted by other CPUs.
    pub(crate) mailbox: ArrayQueue<Shootdown>,
}

impl PerCpuTlb {
    fn new(cpu: CpuId, asid_slots: usize, mailbox_depth: usize) -> Self {
        Self {
            state: Mutex::new(CpuTlbState::new(cpu, asid_slots)),
            mailbox: ArrayQueue::new(mailbox_depth),
        }
    }
}

/// TLB consistency for every CPU of the machine.
///
/// All per-CPU operations take the CPU they run on as their first argument
/// and must be called on that CPU (or, for hosted simulations, by the thread
/// standing in for it).
pub struct TlbManager {
    pub(crate) config: TlbConfig,
    pub(crate) caps: Capabilities,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) kernel: Arc<AddressSpace>,
    pub(crate) cpus: Vec<PerCpuTlb>,
    pub(crate) online: AtomicCpuSet,
    pub(crate) stats: TlbStats,
}

impl TlbManager {
    /// Build the manager. No CPU is online until [`TlbManager::bring_up_cpu`].
    ///
    /// `caps` is sanitized first; the transport is selected once from it.
    pub fn new(
        config: TlbConfig,
        caps: Capabilities,
        kernel: Arc<AddressSpace>,
        hw: Hardware,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        debug_assert!(kernel.is_kernel(), "kernel address space expected");

        let caps = caps.sanitized();
        let asid_slots = config.effective_asid_slots(caps);
        let transport = crate::select(caps, hw.local, hw.hypervisor);
        let cpus = (0..config.nr_cpus)
            .map(|cpu| PerCpuTlb::new(cpu, asid_slots, config.mailbox_depth))
            .collect();

        info!(
            "TLB: {} cpus, {} ASID slots, caps {:?}, flush ceiling {} pages, lazy {:?}",
            config.nr_cpus, asid_slots, caps, config.single_page_flush_ceiling, config.lazy_policy
        );

        Ok(Self {
            config,
            caps,
            transport,
            platform: hw.platform,
            kernel,
            cpus,
            online: AtomicCpuSet::default(),
            stats: TlbStats::default(),
        })
    }

    fn per_cpu(&self, cpu: CpuId) -> &PerCpuTlb {
        match self.cpus.get(cpu) {
            Some(p) => p,
            None => panic!("TLB: CPU {} out of range ({} cpus)", cpu, self.cpus.len()),
        }
    }

    /// Run `f` on `cpu`'s state with interrupts disabled.
    pub(crate) fn with_cpu<R>(
        &self,
        cpu: CpuId,
        f: impl FnOnce(&mut CpuTlbState, &LocalOps<'_>) -> R,
    ) -> R {
        let per_cpu = self.per_cpu(cpu);
        let _irq = IrqGuard::new(self.platform.as_ref());
        let mut state = per_cpu.state.lock();
        let ops = self.local_ops();
        f(&mut state, &ops)
    }

    pub(crate) fn local_ops(&self) -> LocalOps<'_> {
        LocalOps {
            local: self.transport.local(),
            tagging: self.caps.tagging(),
            stats: &self.stats,
        }
    }

    // ========================================================================
    // Lifecycle and context switch
    // ========================================================================

    /// Bring `cpu` up with the kernel address space loaded and start
    /// accepting shootdowns on it.
    pub fn bring_up_cpu(&self, cpu: CpuId) {
        let kernel = self.kernel.clone();
        self.with_cpu(cpu, |state, ops| state.bring_up(&kernel, ops));
        self.online.insert(cpu);
        info!("TLB: cpu {} online", cpu);
    }

    /// Take `cpu` offline: switch to the kernel address space, answer every
    /// pending shootdown and leave the online mask.
    pub fn take_cpu_offline(&self, cpu: CpuId) {
        let kernel = self.kernel.clone();
        self.with_cpu(cpu, |state, ops| {
            state.force_kernel(&kernel, ops);
            self.drain_mailbox(cpu, state, ops);
            self.online.remove(cpu);
            state.tear_down(&kernel, ops);
            // Anything posted between the drain and leaving the mask.
            self.drain_mailbox(cpu, state, ops);
        });
        info!("TLB: cpu {} offline", cpu);
    }

    /// Switch `cpu` to `next`.
    pub fn switch_to(&self, cpu: CpuId, next: &Arc<AddressSpace>) {
        self.with_cpu(cpu, |state, ops| state.switch_mm(next, ops));
    }

    /// `cpu` has no user task to run. Depending on the lazy policy it either
    /// stays in the current address space or switches to the kernel one.
    pub fn enter_lazy(&self, cpu: CpuId) {
        let defer = self.config.lazy_policy.defers(self.caps);
        let kernel = self.kernel.clone();
        self.with_cpu(cpu, |state, ops| state.enter_lazy(defer, &kernel, ops));
    }

    /// Force `cpu` onto the kernel address space with a clean TLB, e.g.
    /// before the address space it was running is destroyed.
    pub fn switch_to_kernel(&self, cpu: CpuId) {
        let kernel = self.kernel.clone();
        self.with_cpu(cpu, |state, ops| state.force_kernel(&kernel, ops));
        debug!("TLB: cpu {} forced onto the kernel address space", cpu);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    // Readers take the state lock with interrupts disabled, like writers.

    pub fn state(&self, cpu: CpuId) -> ExecState {
        self.with_cpu(cpu, |state, _| state.state())
    }

    /// ASID slot `cpu` is running under, `None` before bring-up.
    pub fn loaded_asid(&self, cpu: CpuId) -> Option<Asid> {
        self.with_cpu(cpu, |state, _| state.loaded_asid())
    }

    pub fn slot(&self, cpu: CpuId, asid: Asid) -> AsidSlot {
        self.with_cpu(cpu, |state, _| state.slot(asid))
    }

    /// Generation up to which `cpu`'s TLB is known to be consistent for
    /// `ctx`, if `ctx` owns a slot there.
    pub fn cached_generation(&self, cpu: CpuId, ctx: ContextId) -> Option<u64> {
        self.with_cpu(cpu, |state, _| state.cached_generation(ctx))
    }

    pub fn asid_capacity(&self) -> usize {
        self.config.effective_asid_slots(self.caps)
    }

    pub fn online_cpus(&self) -> CpuSet {
        self.online.load()
    }

    #[inline]
    pub fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.online.contains(cpu)
    }

    pub fn stats(&self) -> TlbStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &TlbConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn kernel_address_space(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }
}
