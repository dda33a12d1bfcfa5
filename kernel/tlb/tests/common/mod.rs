//! Simulated machine for integration tests.
//!
//! `SimTlb` records every primitive per CPU and models a tagged TLB: cached
//! translations are `(tag, root, addr)` entries, global kernel entries have
//! no root. Tests "touch" addresses to populate it and then check that no
//! stale entry survives a flush.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tlb::{
    AddressSpace, Capabilities, CpuId, Hardware, Hypervisor, LocalTlb, Platform, RemoteScope,
    TlbConfig, TlbManager, MAX_CPUS, TLB_FLUSH_ALL,
};

pub const KERNEL_ROOT: u64 = 0x10_0000;

/// Everything a modern x86_64 part offers, bare metal.
pub const TAGGED: Capabilities = Capabilities::ASID_TAGGING
    .union(Capabilities::PAGE_INVALIDATE)
    .union(Capabilities::CONTEXT_INVALIDATE)
    .union(Capabilities::GLOBAL_PAGES);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Load { root: u64, tag: u16, flush: bool },
    Page(u64),
    Context(u16),
    KernelPage(u64),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Entry {
    tag: u16,
    /// `None` for global kernel translations.
    root: Option<u64>,
    addr: u64,
}

#[derive(Default)]
struct CpuSim {
    root: u64,
    tag: u16,
    entries: HashSet<Entry>,
    ops: Vec<Op>,
}

pub struct SimTlb {
    cpus: Vec<Mutex<CpuSim>>,
}

impl SimTlb {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpus: (0..nr_cpus).map(|_| Mutex::new(CpuSim::default())).collect(),
        }
    }

    /// Cache a user translation for `addr` under the loaded root and tag.
    pub fn touch(&self, cpu: CpuId, addr: u64) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        let entry = Entry {
            tag: sim.tag,
            root: Some(sim.root),
            addr,
        };
        sim.entries.insert(entry);
    }

    /// Cache a global kernel translation for `addr`.
    pub fn touch_kernel(&self, cpu: CpuId, addr: u64) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        let entry = Entry {
            tag: sim.tag,
            root: None,
            addr,
        };
        sim.entries.insert(entry);
    }

    /// Whether `cpu` still caches `addr` of the address space at `root`,
    /// under any tag.
    pub fn is_cached(&self, cpu: CpuId, root: u64, addr: u64) -> bool {
        let sim = self.cpus[cpu].lock().unwrap();
        sim.entries
            .iter()
            .any(|e| e.root == Some(root) && e.addr == addr)
    }

    pub fn is_kernel_cached(&self, cpu: CpuId, addr: u64) -> bool {
        let sim = self.cpus[cpu].lock().unwrap();
        sim.entries.iter().any(|e| e.root.is_none() && e.addr == addr)
    }

    /// Whether `cpu` caches anything at all for the address space at `root`.
    pub fn caches_root(&self, cpu: CpuId, root: u64) -> bool {
        let sim = self.cpus[cpu].lock().unwrap();
        sim.entries.iter().any(|e| e.root == Some(root))
    }

    /// Loaded `(root, tag)` of `cpu`.
    pub fn loaded(&self, cpu: CpuId) -> (u64, u16) {
        let sim = self.cpus[cpu].lock().unwrap();
        (sim.root, sim.tag)
    }

    /// Drain the primitives executed on `cpu`.
    pub fn take_ops(&self, cpu: CpuId) -> Vec<Op> {
        std::mem::take(&mut self.cpus[cpu].lock().unwrap().ops)
    }

    pub fn clear_ops(&self) {
        for cpu in &self.cpus {
            cpu.lock().unwrap().ops.clear();
        }
    }

    /// What a hypervisor flush does to `cpu`.
    pub fn remote_flush(&self, cpu: CpuId, scope: RemoteScope) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        match scope {
            RemoteScope::AddressSpace { root, start, end } => {
                let whole = end == TLB_FLUSH_ALL;
                sim.entries.retain(|e| {
                    e.root != Some(root) || (!whole && (e.addr < start || e.addr >= end))
                });
            }
            RemoteScope::NonGlobal => sim.entries.retain(|e| e.root.is_none()),
            RemoteScope::All => sim.entries.clear(),
        }
    }
}

impl LocalTlb for SimTlb {
    fn load_root(&self, cpu: CpuId, root: u64, tag: u16, flush: bool) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        if flush {
            sim.entries.retain(|e| e.root.is_none() || e.tag != tag);
        }
        sim.root = root;
        sim.tag = tag;
        sim.ops.push(Op::Load { root, tag, flush });
    }

    fn invalidate_page(&self, cpu: CpuId, addr: u64) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        let tag = sim.tag;
        sim.entries
            .retain(|e| e.addr != addr || (e.root.is_some() && e.tag != tag));
        sim.ops.push(Op::Page(addr));
    }

    fn invalidate_context(&self, cpu: CpuId, tag: u16) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        sim.entries.retain(|e| e.root.is_none() || e.tag != tag);
        sim.ops.push(Op::Context(tag));
    }

    fn invalidate_kernel_page(&self, cpu: CpuId, addr: u64) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        sim.entries.retain(|e| e.root.is_some() || e.addr != addr);
        sim.ops.push(Op::KernelPage(addr));
    }

    fn invalidate_all(&self, cpu: CpuId) {
        let mut sim = self.cpus[cpu].lock().unwrap();
        sim.entries.clear();
        sim.ops.push(Op::All);
    }
}

/// How shootdown IPIs reach their target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The handler runs on the sender's thread before `send` returns.
    Inline,
    /// The IPI is latched; the thread standing in for the target polls it.
    Polled,
}

pub struct TestPlatform {
    delivery: Delivery,
    latched: Vec<AtomicBool>,
    ipis: Vec<AtomicUsize>,
    /// IPIs to drop before delivering again.
    drop_budget: AtomicUsize,
    /// CPUs whose IPIs are always dropped.
    deaf: AtomicU64,
    preempt_depth: AtomicUsize,
    irq_saves: AtomicUsize,
    irqs_off: AtomicUsize,
}

impl TestPlatform {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            latched: (0..MAX_CPUS).map(|_| AtomicBool::new(false)).collect(),
            ipis: (0..MAX_CPUS).map(|_| AtomicUsize::new(0)).collect(),
            drop_budget: AtomicUsize::new(0),
            deaf: AtomicU64::new(0),
            preempt_depth: AtomicUsize::new(0),
            irq_saves: AtomicUsize::new(0),
            irqs_off: AtomicUsize::new(0),
        }
    }

    pub fn ipis_to(&self, cpu: CpuId) -> usize {
        self.ipis[cpu].load(Ordering::SeqCst)
    }

    pub fn ipis_total(&self) -> usize {
        self.ipis.iter().map(|n| n.load(Ordering::SeqCst)).sum()
    }

    pub fn drop_next_ipis(&self, n: usize) {
        self.drop_budget.store(n, Ordering::SeqCst);
    }

    pub fn make_deaf(&self, cpu: CpuId) {
        self.deaf.fetch_or(1 << cpu, Ordering::SeqCst);
    }

    pub fn preempt_depth(&self) -> usize {
        self.preempt_depth.load(Ordering::SeqCst)
    }

    /// Interrupt-disabled sections entered so far.
    pub fn irq_saves(&self) -> usize {
        self.irq_saves.load(Ordering::SeqCst)
    }

    /// Interrupt-disabled sections currently open.
    pub fn irqs_off(&self) -> usize {
        self.irqs_off.load(Ordering::SeqCst)
    }

    /// Polled delivery: run the handler if an IPI is latched for `cpu`.
    pub fn poll(&self, tlb: &TlbManager, cpu: CpuId) -> bool {
        if self.latched[cpu].swap(false, Ordering::SeqCst) {
            tlb.handle_shootdown_ipi(cpu);
            true
        } else {
            false
        }
    }
}

impl Platform for TestPlatform {
    fn send_shootdown_ipi(&self, tlb: &TlbManager, target: CpuId) {
        self.ipis[target].fetch_add(1, Ordering::SeqCst);
        if self.deaf.load(Ordering::SeqCst) & (1 << target) != 0 {
            return;
        }
        let dropped = self
            .drop_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return;
        }
        match self.delivery {
            Delivery::Inline => tlb.handle_shootdown_ipi(target),
            Delivery::Polled => self.latched[target].store(true, Ordering::SeqCst),
        }
    }

    fn irq_save(&self) -> bool {
        self.irq_saves.fetch_add(1, Ordering::SeqCst);
        self.irqs_off.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn irq_restore(&self, _was_enabled: bool) {
        self.irqs_off.fetch_sub(1, Ordering::SeqCst);
    }

    fn preempt_disable(&self) {
        self.preempt_depth.fetch_add(1, Ordering::SeqCst);
    }

    fn preempt_enable(&self) {
        self.preempt_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hypervisor flush service that applies accepted flushes to the `SimTlb`.
pub struct FakeHypervisor {
    sim: Arc<SimTlb>,
    pub accept: AtomicBool,
    pub calls: Mutex<Vec<(u64, RemoteScope)>>,
}

impl FakeHypervisor {
    pub fn new(sim: Arc<SimTlb>, accept: bool) -> Self {
        Self {
            sim,
            accept: AtomicBool::new(accept),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Hypervisor for FakeHypervisor {
    fn flush_tlb(&self, cpus: u64, scope: RemoteScope) -> bool {
        self.calls.lock().unwrap().push((cpus, scope));
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        for cpu in (0..MAX_CPUS).filter(|&cpu| cpus & (1 << cpu) != 0) {
            self.sim.remote_flush(cpu, scope);
        }
        true
    }
}

pub struct Machine {
    pub tlb: Arc<TlbManager>,
    pub sim: Arc<SimTlb>,
    pub platform: Arc<TestPlatform>,
    pub hypervisor: Option<Arc<FakeHypervisor>>,
}

impl Machine {
    /// `nr_cpus` CPUs, all brought up, default tunables.
    pub fn new(nr_cpus: usize, caps: Capabilities, delivery: Delivery) -> Self {
        Self::build(TlbConfig::default().with_cpus(nr_cpus), caps, delivery, None)
    }

    pub fn build(
        config: TlbConfig,
        caps: Capabilities,
        delivery: Delivery,
        hypervisor: Option<bool>,
    ) -> Self {
        let sim = Arc::new(SimTlb::new(config.nr_cpus));
        let platform = Arc::new(TestPlatform::new(delivery));
        let fake = hypervisor.map(|accept| Arc::new(FakeHypervisor::new(sim.clone(), accept)));
        let service: Option<Arc<dyn Hypervisor>> = match &fake {
            Some(hv) => Some(hv.clone()),
            None => None,
        };
        let local: Arc<dyn LocalTlb> = sim.clone();
        let shared_platform: Arc<dyn Platform> = platform.clone();
        let hw = Hardware {
            local,
            hypervisor: service,
            platform: shared_platform,
        };
        let kernel = Arc::new(AddressSpace::kernel(KERNEL_ROOT));
        let tlb = TlbManager::new(config, caps, kernel, hw).expect("valid config");
        for cpu in 0..config.nr_cpus {
            tlb.bring_up_cpu(cpu);
        }
        sim.clear_ops();
        Self {
            tlb: Arc::new(tlb),
            sim,
            platform,
            hypervisor: fake,
        }
    }

    /// Fresh user address space with a distinct root.
    pub fn address_space(&self) -> Arc<AddressSpace> {
        static NEXT_ROOT: AtomicU64 = AtomicU64::new(0x100_0000);
        Arc::new(AddressSpace::new(NEXT_ROOT.fetch_add(0x1000, Ordering::Relaxed)))
    }
}
