//! CPU sets as 64-bit masks (bit N = CPU N).

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{CpuId, MAX_CPUS};

/// Convert a CPU id to its mask bit, if representable.
#[inline]
fn cpu_bit(cpu: CpuId) -> Option<u64> {
    if cpu < MAX_CPUS {
        Some(1u64 << cpu)
    } else {
        None
    }
}

/// Snapshot of a set of CPUs.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: CpuSet = CpuSet(0);

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Set containing CPUs `0..n`.
    pub fn first(n: usize) -> Self {
        if n >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    pub fn single(cpu: CpuId) -> Self {
        Self(cpu_bit(cpu).unwrap_or(0))
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn contains(self, cpu: CpuId) -> bool {
        cpu_bit(cpu).map_or(false, |bit| self.0 & bit != 0)
    }

    pub fn insert(&mut self, cpu: CpuId) {
        if let Some(bit) = cpu_bit(cpu) {
            self.0 |= bit;
        }
    }

    pub fn remove(&mut self, cpu: CpuId) {
        if let Some(bit) = cpu_bit(cpu) {
            self.0 &= !bit;
        }
    }

    /// This set without `cpu`.
    #[inline]
    pub fn without(mut self, cpu: CpuId) -> Self {
        self.remove(cpu);
        self
    }

    #[inline]
    pub fn union(self, other: CpuSet) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub fn intersection(self, other: CpuSet) -> Self {
        Self(self.0 & other.0)
    }

    /// CPUs in `self` but not in `other`.
    #[inline]
    pub fn difference(self, other: CpuSet) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> CpuSetIter {
        CpuSetIter(self.0)
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl IntoIterator for CpuSet {
    type Item = CpuId;
    type IntoIter = CpuSetIter;

    fn into_iter(self) -> CpuSetIter {
        self.iter()
    }
}

/// Ascending iterator over the CPUs of a [`CpuSet`].
pub struct CpuSetIter(u64);

impl Iterator for CpuSetIter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros() as CpuId;
        self.0 &= self.0 - 1;
        Some(cpu)
    }
}

/// Concurrently updated CPU set.
///
/// Updates are SeqCst: joining an affinity set must be ordered against the
/// generation read that follows it (see [`crate::generation`]).
#[derive(Default)]
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    #[inline]
    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::SeqCst))
    }

    /// Add `cpu`; returns whether it was already present.
    pub fn insert(&self, cpu: CpuId) -> bool {
        match cpu_bit(cpu) {
            Some(bit) => self.0.fetch_or(bit, Ordering::SeqCst) & bit != 0,
            None => false,
        }
    }

    /// Remove `cpu`; returns whether it was present.
    pub fn remove(&self, cpu: CpuId) -> bool {
        match cpu_bit(cpu) {
            Some(bit) => self.0.fetch_and(!bit, Ordering::SeqCst) & bit != 0,
            None => false,
        }
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        self.load().contains(cpu)
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iter_is_ascending() {
        let set = CpuSet::from_bits(0b1010_0101);
        let cpus: Vec<_> = set.iter().collect();
        assert_eq!(cpus, vec![0, 2, 5, 7]);
        assert_eq!(set.count(), 4);
    }

    #[test]
    fn out_of_range_cpu_is_ignored() {
        let mut set = CpuSet::EMPTY;
        set.insert(MAX_CPUS);
        assert!(set.is_empty());
        assert!(!set.contains(MAX_CPUS));
        assert!(CpuSet::single(MAX_CPUS + 3).is_empty());
    }

    #[test]
    fn first_n_cpus() {
        assert_eq!(CpuSet::first(0), CpuSet::EMPTY);
        assert_eq!(CpuSet::first(3).bits(), 0b111);
        assert_eq!(CpuSet::first(MAX_CPUS).bits(), u64::MAX);
    }

    #[test]
    fn set_algebra() {
        let a = CpuSet::from_bits(0b0110);
        let b = CpuSet::from_bits(0b0011);
        assert_eq!(a.union(b).bits(), 0b0111);
        assert_eq!(a.intersection(b).bits(), 0b0010);
        assert_eq!(a.difference(b).bits(), 0b0100);
        assert_eq!(a.without(1).bits(), 0b0100);
    }

    #[test]
    fn atomic_insert_remove_report_previous_state() {
        let set = AtomicCpuSet::default();
        assert!(!set.insert(3));
        assert!(set.insert(3));
        assert!(set.contains(3));
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(set.load().is_empty());
    }
}
