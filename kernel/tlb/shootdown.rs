//! TLB Shootdown
//!
//! Cross-CPU invalidation for address spaces and kernel mappings.
//!
//! # Protocol
//!
//! 1. The caller changes page tables and bumps the address space's generation
//!    (done here by the public flush functions).
//! 2. Target CPUs are snapshotted once: the affinity set for a single address
//!    space, every online CPU for a global flush, the accumulated set for a
//!    batch. Only online CPUs are kept.
//! 3. Remote CPUs are reached through the transport. If the hypervisor takes
//!    the request, nothing else is needed. Otherwise the request is posted to
//!    each target's mailbox together with a shared [`Ticket`] and a shootdown
//!    IPI is sent.
//! 4. The calling CPU handles its own part directly.
//! 5. The caller spins until every target has acknowledged on the ticket,
//!    servicing its own mailbox meanwhile so two CPUs shooting each other
//!    down cannot deadlock.
//!
//! Every call returns only once consistency is established on every target:
//! the caller may free the pages that were unmapped right after.
//!
//! # Memory Ordering
//!
//! - Sender: page-table stores, generation bump (SeqCst), mailbox push.
//! - Handler: mailbox pop, flush, ack on the ticket (SeqCst).
//! - Sender: observes the ack, so the flush happened before it returns.
//!
//! # Failure
//!
//! A CPU that does not acknowledge gets the IPI resent up to
//! `ack_retries` times. After that the kernel panics: a CPU that never
//! flushed may keep translations to freed frames, so continuing is never an
//! option.

use alloc::sync::Arc;
use core::hint::spin_loop;
use log::{debug, error, warn};

use crate::address_space::AddressSpace;
use crate::batch::TlbBatch;
use crate::cpu_state::{CpuTlbState, LocalOps};
use crate::cpumask::{AtomicCpuSet, CpuSet};
use crate::manager::TlbManager;
use crate::platform::PreemptGuard;
use crate::request::{FlushRequest, FlushTarget};
use crate::stats;
use crate::{CpuId, RemoteScope, PAGE_SIZE, TLB_FLUSH_ALL};

/// Acknowledgements for one dispatched request.
#[derive(Debug, Default)]
pub(crate) struct Ticket {
    acked: AtomicCpuSet,
}

/// A request sitting in a CPU's mailbox.
pub(crate) struct Shootdown {
    pub(crate) request: FlushRequest,
    pub(crate) ticket: Arc<Ticket>,
}

impl TlbManager {
    // ========================================================================
    // Public flush interface
    // ========================================================================

    /// Flush every translation of `mm` on every CPU that may cache it.
    ///
    /// Bumps `mm`'s generation; call after the page-table change is complete.
    pub fn flush_address_space(&self, cpu: CpuId, mm: &AddressSpace) {
        self.flush_range(cpu, mm, 0, TLB_FLUSH_ALL);
    }

    /// Flush `[start, end)` of `mm` on every CPU that may cache it.
    ///
    /// The range is widened to page boundaries. Ranges above the configured
    /// ceiling become whole-address-space flushes, and so does every range on
    /// hardware without per-page invalidation or without ASID tagging.
    /// `end == TLB_FLUSH_ALL` flushes the whole address space.
    pub fn flush_range(&self, cpu: CpuId, mm: &AddressSpace, start: u64, end: u64) {
        debug_assert!(!mm.is_kernel(), "use flush_kernel_range for kernel mappings");
        let generation = mm.bump_generation();
        // Untagged, every user flush covers the whole address space.
        let per_page = self.caps.per_page() && self.caps.tagging();
        let request = FlushRequest::range(
            mm.context_id(),
            start,
            end,
            generation,
            self.config.single_page_flush_ceiling,
            per_page,
        );
        self.request_flush(cpu, request, Some(mm));
    }

    /// Flush the single page containing `addr`.
    #[inline]
    pub fn flush_page(&self, cpu: CpuId, mm: &AddressSpace, addr: u64) {
        let end = addr.checked_add(PAGE_SIZE).unwrap_or(TLB_FLUSH_ALL);
        self.flush_range(cpu, mm, addr, end);
    }

    /// Flush kernel mappings `[start, end)` on every online CPU.
    pub fn flush_kernel_range(&self, cpu: CpuId, start: u64, end: u64) {
        let request = FlushRequest::kernel_range(
            start,
            end,
            self.config.single_page_flush_ceiling,
            self.caps.per_page(),
        );
        self.request_flush(cpu, request, None);
    }

    /// Flush everything, global kernel translations included, on every
    /// online CPU.
    pub fn flush_all(&self, cpu: CpuId) {
        self.request_flush(cpu, FlushRequest::global(), None);
    }

    /// Dispatch an already built request and wait for it to complete.
    ///
    /// `Context` requests go to `mm`'s affinity set (every online CPU if
    /// `mm` is not given); `Loaded` and `Global` requests go to every online
    /// CPU. Receivers skip requests they are already current for, so
    /// delivering the same request twice is harmless.
    pub fn request_flush(&self, cpu: CpuId, request: FlushRequest, mm: Option<&AddressSpace>) {
        let online = self.online.load();
        let (targets, scope) = match (request.target, mm) {
            (FlushTarget::Context(ctx), Some(mm)) => {
                debug_assert_eq!(ctx, mm.context_id(), "request for another address space");
                let scope = RemoteScope::AddressSpace {
                    root: mm.root(),
                    start: request.start,
                    end: request.end,
                };
                (mm.affinity_set(), scope)
            }
            (FlushTarget::Context(_), None) | (FlushTarget::Loaded, _) => {
                (online, RemoteScope::NonGlobal)
            }
            (FlushTarget::Global, _) => {
                stats::inc(&self.stats.global_flushes);
                (online, RemoteScope::All)
            }
        };
        self.dispatch(cpu, request, targets, scope);
    }

    // ========================================================================
    // Batched unmap
    // ========================================================================

    /// Record that `mm` had mappings removed whose flush is deferred to
    /// [`TlbManager::batch_commit`].
    pub fn batch_add(&self, batch: &mut TlbBatch, mm: &AddressSpace) {
        debug_assert!(!mm.is_kernel(), "kernel mappings cannot be batched");
        batch.add(mm);
    }

    /// Flush everything accumulated in `batch` with one dispatch.
    ///
    /// Must run before the unmapped pages go back to the allocator.
    pub fn batch_commit(&self, cpu: CpuId, batch: &mut TlbBatch) {
        if batch.is_empty() {
            return;
        }
        let targets = batch.cpus();
        debug!(
            "TLB: cpu {} commits batch of {} address spaces to cpus {:?}",
            cpu,
            batch.len(),
            targets
        );
        self.dispatch(cpu, FlushRequest::loaded(), targets, RemoteScope::NonGlobal);
        batch.clear();
    }

    // ========================================================================
    // Receiver side
    // ========================================================================

    /// Shootdown IPI entry point. Must run on `cpu` with interrupts disabled.
    pub fn handle_shootdown_ipi(&self, cpu: CpuId) {
        self.with_cpu(cpu, |state, ops| self.drain_mailbox(cpu, state, ops));
    }

    /// Apply and acknowledge every request queued for `cpu`.
    ///
    /// A CPU that is not online only acknowledges: its TLB holds nothing the
    /// sender cares about.
    pub(crate) fn drain_mailbox(&self, cpu: CpuId, state: &mut CpuTlbState, ops: &LocalOps<'_>) {
        let mailbox = &self.cpus[cpu].mailbox;
        while let Some(msg) = mailbox.pop() {
            if state.is_online() {
                state.handle_flush(&msg.request, ops);
            }
            msg.ticket.acked.insert(cpu);
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run `request` on every online CPU in `targets` and wait for all of them.
    pub(crate) fn dispatch(
        &self,
        cpu: CpuId,
        request: FlushRequest,
        targets: CpuSet,
        scope: RemoteScope,
    ) {
        let _preempt = PreemptGuard::new(self.platform.as_ref());

        let targets = targets.intersection(self.online.load());
        let remote = targets.without(cpu);

        let pending = if remote.is_empty() {
            None
        } else if self.transport.flush_remote(remote.bits(), scope) {
            // Remote slots keep their old generation and take one extra full
            // flush the next time they are checked.
            stats::inc(&self.stats.hypervisor_flushes);
            None
        } else {
            Some(self.post_and_signal(cpu, request, remote))
        };

        if targets.contains(cpu) {
            self.with_cpu(cpu, |state, ops| state.handle_flush(&request, ops));
        }

        if let Some(ticket) = pending {
            self.wait_for_acks(cpu, remote, &ticket, &request);
        }
    }

    /// Post `request` to every mailbox in `remote` and raise the IPIs.
    fn post_and_signal(&self, cpu: CpuId, request: FlushRequest, remote: CpuSet) -> Arc<Ticket> {
        let ticket = Arc::new(Ticket::default());
        for target in remote {
            self.post(cpu, target, request, &ticket);
        }
        for target in remote {
            self.send_ipi(target);
        }
        ticket
    }

    /// Push one request into `target`'s mailbox, waiting for room if needed.
    fn post(&self, cpu: CpuId, target: CpuId, request: FlushRequest, ticket: &Arc<Ticket>) {
        let mailbox = &self.cpus[target].mailbox;
        let mut msg = Shootdown {
            request,
            ticket: ticket.clone(),
        };
        let mut spins = 0usize;
        let mut nudges = 0usize;
        loop {
            match mailbox.push(msg) {
                Ok(()) => return,
                Err(back) => msg = back,
            }
            if !self.is_cpu_online(target) {
                // Nobody will drain it; acknowledge on its behalf.
                ticket.acked.insert(target);
                return;
            }
            self.service_own_mailbox(cpu);
            spins += 1;
            if spins >= self.config.ack_timeout_spins {
                spins = 0;
                nudges += 1;
                if nudges > self.config.ack_retries {
                    error!(
                        "TLB: mailbox of cpu {} stayed full after {} IPIs",
                        target, nudges
                    );
                    panic!(
                        "CRITICAL: TLB shootdown could not reach CPU {}. \
                         Cannot continue - stale TLB entries would cause memory corruption.",
                        target
                    );
                }
                warn!("TLB: mailbox of cpu {} full, re-sending IPI", target);
                stats::inc(&self.stats.ipi_retries);
                self.send_ipi(target);
            }
            spin_loop();
        }
    }

    fn send_ipi(&self, target: CpuId) {
        stats::inc(&self.stats.ipis_sent);
        self.platform.send_shootdown_ipi(self, target);
    }

    fn service_own_mailbox(&self, cpu: CpuId) {
        if self.cpus.get(cpu).map_or(false, |p| !p.mailbox.is_empty()) {
            self.handle_shootdown_ipi(cpu);
        }
    }

    /// Targets that neither acknowledged nor went offline.
    fn unacked(&self, remote: CpuSet, ticket: &Ticket) -> CpuSet {
        remote
            .difference(ticket.acked.load())
            .intersection(self.online.load())
    }

    /// Spin until every CPU in `remote` acknowledged `ticket`.
    ///
    /// TLB shootdown failure is FATAL: a CPU that never flushed may still
    /// map freed frames or stale permissions.
    fn wait_for_acks(&self, cpu: CpuId, remote: CpuSet, ticket: &Ticket, request: &FlushRequest) {
        for attempt in 0..=self.config.ack_retries {
            for _ in 0..self.config.ack_timeout_spins {
                if self.unacked(remote, ticket).is_empty() {
                    return;
                }
                self.service_own_mailbox(cpu);
                spin_loop();
            }

            let unacked = self.unacked(remote, ticket);
            if unacked.is_empty() {
                return;
            }
            if attempt < self.config.ack_retries {
                warn!(
                    "TLB: shootdown {:?} from cpu {} not acknowledged by {:?}, re-sending IPIs (attempt {})",
                    request.target,
                    cpu,
                    unacked,
                    attempt + 1
                );
                for target in unacked {
                    stats::inc(&self.stats.ipi_retries);
                    self.send_ipi(target);
                }
            }
        }

        let unacked = self.unacked(remote, ticket);
        if unacked.is_empty() {
            return;
        }
        error!(
            "TLB: shootdown {:?} [{:#x}, {:#x}) failed after {} retries, cpus {:?} not responding",
            request.target, request.start, request.end, self.config.ack_retries, unacked
        );
        panic!(
            "CRITICAL: TLB shootdown failed! CPUs {:?} did not ACK. \
             Cannot continue - stale TLB entries would cause memory corruption.",
            unacked
        );
    }
}
