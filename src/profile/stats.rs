//! Per-routine execution statistics.
//!
//! The static shape of a routine (which branches and call sites it has) is
//! fixed when the routine is first instrumented. Only the counters change
//! afterwards, and they are plain atomics so counter callbacks coming from
//! several target threads never need a lock.

use crate::profile::validity::ValidityVerdict;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one static conditional branch.
#[derive(Debug)]
pub struct BranchStat {
    addr: u64,
    taken: AtomicU64,
    reached: AtomicU64,
}

/// A consistent reading of a [`BranchStat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BranchCounts {
    pub taken: u64,
    pub reached: u64,
}

impl BranchCounts {
    /// Fraction of executions that took the branch, `None` if it never ran.
    pub fn taken_ratio(&self) -> Option<f64> {
        if self.reached == 0 {
            None
        } else {
            Some(self.taken as f64 / self.reached as f64)
        }
    }
}

impl BranchStat {
    pub fn new(addr: u64) -> Self {
        Self::with_counts(addr, 0, 0)
    }

    /// Seed a branch with existing counts. `taken` is clamped to `reached`.
    pub fn with_counts(addr: u64, taken: u64, reached: u64) -> Self {
        Self {
            addr,
            taken: AtomicU64::new(taken.min(reached)),
            reached: AtomicU64::new(reached),
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Count one execution of the branch.
    #[inline]
    pub fn record(&self, taken: bool) {
        self.reached.fetch_add(1, Ordering::Relaxed);
        if taken {
            self.taken.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counts(&self) -> BranchCounts {
        let taken = self.taken.load(Ordering::Relaxed);
        let reached = self.reached.load(Ordering::Relaxed);
        BranchCounts {
            taken: taken.min(reached),
            reached,
        }
    }
}

/// Counter of one static direct call site.
#[derive(Debug)]
pub struct CallStat {
    callee_addr: u64,
    call_addr: u64,
    count: AtomicU64,
}

impl CallStat {
    pub fn new(callee_addr: u64, call_addr: u64) -> Self {
        Self::with_count(callee_addr, call_addr, 0)
    }

    pub fn with_count(callee_addr: u64, call_addr: u64, count: u64) -> Self {
        Self {
            callee_addr,
            call_addr,
            count: AtomicU64::new(count),
        }
    }

    pub fn callee_addr(&self) -> u64 {
        self.callee_addr
    }

    /// Address of the call instruction.
    pub fn call_addr(&self) -> u64 {
        self.call_addr
    }

    #[inline]
    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Statistics of one routine of the main executable.
#[derive(Debug)]
pub struct RoutineProfile {
    name: String,
    addr: u64,
    heat: AtomicU64,
    entries: AtomicU64,
    verdict: ValidityVerdict,
    branches: Vec<BranchStat>,
    calls: Vec<CallStat>,
}

impl RoutineProfile {
    pub fn new(
        name: impl Into<String>,
        addr: u64,
        verdict: ValidityVerdict,
        branches: Vec<BranchStat>,
        calls: Vec<CallStat>,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            heat: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            verdict,
            branches,
            calls,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn verdict(&self) -> ValidityVerdict {
        self.verdict
    }

    /// Add `instructions` executed instructions to the routine's heat.
    #[inline]
    pub fn add_heat(&self, instructions: u64) {
        self.heat.fetch_add(instructions, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entry(&self) {
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heat(&self) -> u64 {
        self.heat.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Branches in address order.
    pub fn branches(&self) -> &[BranchStat] {
        &self.branches
    }

    /// Call sites in address order.
    pub fn calls(&self) -> &[CallStat] {
        &self.calls
    }

    pub fn branch_at(&self, addr: u64) -> Option<&BranchStat> {
        self.branches.iter().find(|b| b.addr == addr)
    }

    pub fn call_at(&self, addr: u64) -> Option<&CallStat> {
        self.calls.iter().find(|c| c.call_addr == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn branch_counts() {
        let b = BranchStat::new(0x10);
        assert_eq!(b.counts().taken_ratio(), None);
        b.record(true);
        b.record(true);
        b.record(false);
        b.record(true);
        let counts = b.counts();
        assert_eq!(counts, BranchCounts { taken: 3, reached: 4 });
        assert_eq!(counts.taken_ratio(), Some(0.75));
    }

    #[test]
    fn seeded_counts_keep_taken_below_reached() {
        let b = BranchStat::with_counts(0x10, 12, 5);
        assert_eq!(b.counts(), BranchCounts { taken: 5, reached: 5 });
    }

    #[test]
    fn concurrent_updates_are_exact() {
        let rtn = Arc::new(RoutineProfile::new(
            "f",
            0x1000,
            ValidityVerdict::Valid,
            vec![BranchStat::new(0x1004)],
            vec![CallStat::new(0x2000, 0x1008)],
        ));
        thread::scope(|s| {
            for _ in 0..4 {
                let rtn = Arc::clone(&rtn);
                s.spawn(move || {
                    for i in 0..1000 {
                        rtn.record_entry();
                        rtn.add_heat(3);
                        rtn.branches()[0].record(i % 2 == 0);
                        rtn.calls()[0].record();
                    }
                });
            }
        });
        assert_eq!(rtn.entry_count(), 4000);
        assert_eq!(rtn.heat(), 12000);
        assert_eq!(rtn.branches()[0].counts(), BranchCounts { taken: 2000, reached: 4000 });
        assert_eq!(rtn.call_at(0x1008).unwrap().count(), 4000);
        assert!(rtn.branch_at(0x1005).is_none());
    }
}
