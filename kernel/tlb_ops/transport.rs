//! Invalidation transport strategies.
//!
//! Local invalidation always goes through a [`LocalTlb`]. The strategies
//! differ in how remote CPUs are reached:
//!
//! - [`Direct`]: remote CPUs are interrupted (IPI) and flush themselves.
//! - [`Virtualized`]: the request is first handed to the hypervisor, which
//!   can flush vCPUs that are not even running. IPIs are the fallback when
//!   the service rejects a request.

use alloc::boxed::Box;
use alloc::sync::Arc;
use log::{info, warn};

use crate::{Capabilities, LocalTlb};

/// What a remote flush must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteScope {
    /// Translations of the address space rooted at `root` within
    /// `[start, end)`; `end == TLB_FLUSH_ALL` covers all of it.
    AddressSpace { root: u64, start: u64, end: u64 },
    /// Every non-global translation of every address space.
    NonGlobal,
    /// Everything, global kernel translations included.
    All,
}

/// Hypervisor-provided TLB flush service.
pub trait Hypervisor: Send + Sync {
    /// Flush `scope` on every vCPU whose bit is set in `cpus`.
    ///
    /// Returns `false` when the request was not carried out; the caller then
    /// falls back to IPIs.
    fn flush_tlb(&self, cpus: u64, scope: RemoteScope) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Virtualized,
}

/// How invalidations reach the hardware.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Primitives for the executing CPU.
    fn local(&self) -> &dyn LocalTlb;

    /// Try to flush `scope` on the CPUs in `cpus` without interrupting them.
    ///
    /// Returns `true` if the flush is complete on return. `false` means the
    /// caller must deliver the request to each CPU itself.
    fn flush_remote(&self, cpus: u64, scope: RemoteScope) -> bool;
}

/// Bare-metal strategy: instructions locally, IPIs remotely.
pub struct Direct {
    local: Arc<dyn LocalTlb>,
}

impl Direct {
    pub fn new(local: Arc<dyn LocalTlb>) -> Self {
        Self { local }
    }
}

impl Transport for Direct {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn local(&self) -> &dyn LocalTlb {
        self.local.as_ref()
    }

    fn flush_remote(&self, _cpus: u64, _scope: RemoteScope) -> bool {
        false
    }
}

/// Paravirtual strategy: remote flushes go through the hypervisor.
pub struct Virtualized {
    local: Arc<dyn LocalTlb>,
    hypervisor: Arc<dyn Hypervisor>,
}

impl Virtualized {
    pub fn new(local: Arc<dyn LocalTlb>, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { local, hypervisor }
    }
}

impl Transport for Virtualized {
    fn kind(&self) -> TransportKind {
        TransportKind::Virtualized
    }

    fn local(&self) -> &dyn LocalTlb {
        self.local.as_ref()
    }

    fn flush_remote(&self, cpus: u64, scope: RemoteScope) -> bool {
        if cpus == 0 {
            return true;
        }
        let done = self.hypervisor.flush_tlb(cpus, scope);
        if !done {
            warn!(
                "hypervisor rejected TLB flush for cpus {:#x} ({:?}), falling back to IPIs",
                cpus, scope
            );
        }
        done
    }
}

/// Pick the transport for this boot.
///
/// The virtualized strategy is used only when a hypervisor is detected and a
/// flush service was registered for it.
pub fn select(
    caps: Capabilities,
    local: Arc<dyn LocalTlb>,
    hypervisor: Option<Arc<dyn Hypervisor>>,
) -> Box<dyn Transport> {
    match hypervisor {
        Some(hv) if caps.contains(Capabilities::HYPERVISOR) => {
            info!("TLB transport: virtualized (hypervisor flush service)");
            Box::new(Virtualized::new(local, hv))
        }
        _ => {
            info!("TLB transport: direct (caps {:?})", caps);
            Box::new(Direct::new(local))
        }
    }
}
