//! TLB tunables.

use core::fmt;

use crate::asid::TLB_NR_DYN_ASIDS;
use crate::{Capabilities, MAX_CPUS};

/// Ranges of up to this many pages are flushed page by page.
pub const DEFAULT_SINGLE_PAGE_FLUSH_CEILING: u64 = 33;

/// Spin iterations to wait for ACKs before resending IPIs.
/// At ~2GHz, 1M iterations is roughly 0.5-1ms.
pub const DEFAULT_ACK_TIMEOUT_SPINS: usize = 1_000_000;

/// IPI resends before a shootdown is declared failed.
pub const DEFAULT_ACK_RETRIES: usize = 3;

/// Queued shootdowns per CPU.
pub const DEFAULT_MAILBOX_DEPTH: usize = 16;

/// What an idle CPU does with the user address space it was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyPolicy {
    /// Defer when switching is expensive: no ASID tagging, so every switch
    /// back would be a full flush.
    Auto,
    /// Always stay in the user address space (lazy mode).
    Defer,
    /// Always switch to the kernel address space right away.
    SwitchNow,
}

impl LazyPolicy {
    pub fn defers(self, caps: Capabilities) -> bool {
        match self {
            LazyPolicy::Auto => !caps.tagging(),
            LazyPolicy::Defer => true,
            LazyPolicy::SwitchNow => false,
        }
    }
}

/// Errors from [`TlbConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Zero CPUs, or more than a CPU mask can represent.
    InvalidCpuCount(usize),
    /// ASID slot count outside `1..=TLB_NR_DYN_ASIDS`.
    InvalidAsidSlots(usize),
    /// Mailbox depth of zero.
    InvalidMailboxDepth,
    /// Zero spins per ACK wait.
    InvalidAckTimeout,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCpuCount(n) => {
                write!(f, "cpu count {} outside 1..={}", n, MAX_CPUS)
            }
            ConfigError::InvalidAsidSlots(n) => {
                write!(f, "ASID slot count {} outside 1..={}", n, TLB_NR_DYN_ASIDS)
            }
            ConfigError::InvalidMailboxDepth => {
                write!(f, "shootdown mailbox depth must be non-zero")
            }
            ConfigError::InvalidAckTimeout => write!(f, "ACK timeout must be non-zero"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbConfig {
    pub nr_cpus: usize,
    /// Dynamic ASID slots per CPU. Ignored (treated as 1) without tagging.
    pub asid_slots: usize,
    /// Largest range, in pages, invalidated page by page.
    pub single_page_flush_ceiling: u64,
    pub lazy_policy: LazyPolicy,
    pub ack_timeout_spins: usize,
    pub ack_retries: usize,
    pub mailbox_depth: usize,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self {
            nr_cpus: MAX_CPUS,
            asid_slots: TLB_NR_DYN_ASIDS,
            single_page_flush_ceiling: DEFAULT_SINGLE_PAGE_FLUSH_CEILING,
            lazy_policy: LazyPolicy::Auto,
            ack_timeout_spins: DEFAULT_ACK_TIMEOUT_SPINS,
            ack_retries: DEFAULT_ACK_RETRIES,
            mailbox_depth: DEFAULT_MAILBOX_DEPTH,
        }
    }
}

impl TlbConfig {
    pub fn with_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub fn with_asid_slots(mut self, slots: usize) -> Self {
        self.asid_slots = slots;
        self
    }

    pub fn with_flush_ceiling(mut self, pages: u64) -> Self {
        self.single_page_flush_ceiling = pages;
        self
    }

    pub fn with_lazy_policy(mut self, policy: LazyPolicy) -> Self {
        self.lazy_policy = policy;
        self
    }

    pub fn with_ack_timeout(mut self, spins: usize, retries: usize) -> Self {
        self.ack_timeout_spins = spins;
        self.ack_retries = retries;
        self
    }

    pub fn with_mailbox_depth(mut self, depth: usize) -> Self {
        self.mailbox_depth = depth;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(ConfigError::InvalidCpuCount(self.nr_cpus));
        }
        if self.asid_slots == 0 || self.asid_slots > TLB_NR_DYN_ASIDS {
            return Err(ConfigError::InvalidAsidSlots(self.asid_slots));
        }
        if self.mailbox_depth == 0 {
            return Err(ConfigError::InvalidMailboxDepth);
        }
        if self.ack_timeout_spins == 0 {
            return Err(ConfigError::InvalidAckTimeout);
        }
        Ok(())
    }

    /// ASID slots actually usable with `caps`.
    pub fn effective_asid_slots(&self, caps: Capabilities) -> usize {
        if caps.tagging() {
            self.asid_slots
        } else {
            1
        }
    }
}
