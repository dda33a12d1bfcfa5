//! TLB consistency for SMP.
//!
//! Keeps every CPU's translation cache consistent with the page tables of
//! the address spaces it runs, using ASID-tagged TLB entries so a CPU can
//! keep several address spaces resident and flush only what changed.
//!
//! # Pieces
//!
//! | Module | Role |
//! |--------|------|
//! | [`generation`] | Per-address-space version bumped on every change |
//! | [`asid`] | Per-CPU slot table: which address space, consistent up to which generation |
//! | [`cpu_state`] | Per-CPU state machine (kernel / active user / lazy user) |
//! | [`shootdown`] | Flush requests, local vs. remote execution, blocking ACK wait |
//! | [`batch`] | One combined shootdown for many unmaps |
//!
//! Hardware access goes through `tlb_ops`: the transport (direct or
//! hypervisor-assisted) is chosen once when the [`TlbManager`] is built.
//!
//! # Usage
//!
//! ```ignore
//! let tlb = tlb::init(TlbManager::new(config, Capabilities::probe(), kernel, hw)?);
//! tlb.bring_up_cpu(cpu);
//! tlb.switch_to(cpu, &mm);
//! // ... unmap ...
//! tlb.flush_range(cpu, &mm, start, end);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod asid;
pub mod batch;
pub mod config;
pub mod cpu_state;
pub mod cpumask;
pub mod generation;
pub mod manager;
pub mod platform;
pub mod request;
pub mod shootdown;
pub mod stats;

pub use address_space::{AddressSpace, ContextId};
pub use asid::{Asid, AsidSlot, GEN_UNKNOWN, TLB_NR_DYN_ASIDS};
pub use batch::TlbBatch;
pub use config::{ConfigError, LazyPolicy, TlbConfig};
pub use cpu_state::{ExecState, FlushOutcome};
pub use cpumask::CpuSet;
pub use manager::{Hardware, TlbManager};
pub use platform::Platform;
pub use request::{FlushRequest, FlushTarget};
pub use stats::TlbStatsSnapshot;

pub use tlb_ops::{
    hw_tag, select, Capabilities, CpuId, Hypervisor, LocalTlb, RemoteScope, Transport,
    TransportKind, PAGE_SIZE, TLB_FLUSH_ALL,
};
#[cfg(target_arch = "x86_64")]
pub use tlb_ops::X86Tlb;

use spin::Once;

/// Largest CPU count: CPU sets are 64-bit masks.
pub const MAX_CPUS: usize = 64;

static TLB: Once<TlbManager> = Once::new();

/// Install `manager` as the process-wide instance.
///
/// Only the first call installs; later calls return the existing instance
/// and drop their argument.
pub fn init(manager: TlbManager) -> &'static TlbManager {
    TLB.call_once(|| manager)
}

/// The process-wide instance, once [`init`] has run.
#[inline]
pub fn get() -> Option<&'static TlbManager> {
    TLB.get()
}
