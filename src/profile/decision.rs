// This module turns the statistics of one routine into its decision record, the compact unit
// the rewrite pass consumes. Two selections are made independently. The reorder candidate is
// the biased branch (taken on at least the configured fraction of its executions) that ran most
// often. The inline candidate is the call site executed most often whose callee was classified
// VALID when it was profiled. On equal counts the earlier site in address order keeps the slot.
// Offsets are stored relative to the routine entry, and an offset of zero means "none", so a
// candidate sitting on the entry instruction cannot be recorded and is skipped.

//! Decision records and offset selection.

use crate::profile::stats::RoutineProfile;
use crate::profile::validity::ValidityVerdict;
use std::fmt;

/// The optimization bitmask of a decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct OptMode(u8);

impl OptMode {
    pub const NONE: OptMode = OptMode(0);
    pub const INLINE: OptMode = OptMode(0b01);
    pub const REORDER: OptMode = OptMode(0b10);

    /// Rebuild a mode from its persisted form. Unknown bits are rejected.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !(Self::INLINE.0 | Self::REORDER.0) == 0 {
            Some(OptMode(bits))
        } else {
            None
        }
    }

    /// The mode implied by a pair of offsets.
    pub fn from_offsets(branch_offset: u32, inline_offset: u32) -> Self {
        let mut mode = Self::NONE;
        if inline_offset != 0 {
            mode = mode | Self::INLINE;
        }
        if branch_offset != 0 {
            mode = mode | Self::REORDER;
        }
        mode
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: OptMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for OptMode {
    type Output = OptMode;

    fn bitor(self, rhs: OptMode) -> OptMode {
        OptMode(self.0 | rhs.0)
    }
}

/// What the rewrite pass should do with one routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    name: String,
    addr: u64,
    heat: u64,
    opt_mode: OptMode,
    branch_offset: u32,
    inline_offset: u32,
    inline_callee: String,
}

impl DecisionRecord {
    /// Build a record and derive its mode from the offsets. The callee name
    /// is dropped if there is nothing to inline.
    pub fn new(
        name: impl Into<String>,
        addr: u64,
        heat: u64,
        branch_offset: u32,
        inline_offset: u32,
        inline_callee: impl Into<String>,
    ) -> Self {
        let mut inline_callee = inline_callee.into();
        if inline_offset == 0 {
            inline_callee.clear();
        }
        Self {
            name: name.into(),
            addr,
            heat,
            opt_mode: OptMode::from_offsets(branch_offset, inline_offset),
            branch_offset,
            inline_offset,
            inline_callee,
        }
    }

    /// A record that leaves the routine as it is.
    pub fn none(name: impl Into<String>, addr: u64, heat: u64) -> Self {
        Self::new(name, addr, heat, 0, 0, String::new())
    }

    /// Rebuild a record from persisted fields, checking that the mode and the
    /// callee name agree with the offsets.
    pub fn from_parts(
        name: impl Into<String>,
        addr: u64,
        heat: u64,
        opt_mode: u8,
        branch_offset: u32,
        inline_offset: u32,
        inline_callee: impl Into<String>,
    ) -> Option<Self> {
        let mode = OptMode::from_bits(opt_mode)?;
        let inline_callee = inline_callee.into();
        if mode != OptMode::from_offsets(branch_offset, inline_offset)
            || (inline_offset == 0) != inline_callee.is_empty()
        {
            return None;
        }
        Some(Self::new(
            name,
            addr,
            heat,
            branch_offset,
            inline_offset,
            inline_callee,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn heat(&self) -> u64 {
        self.heat
    }

    pub fn opt_mode(&self) -> OptMode {
        self.opt_mode
    }

    pub fn branch_offset(&self) -> u32 {
        self.branch_offset
    }

    pub fn inline_offset(&self) -> u32 {
        self.inline_offset
    }

    pub fn inline_callee(&self) -> &str {
        &self.inline_callee
    }

    pub fn reorders(&self) -> bool {
        self.opt_mode.contains(OptMode::REORDER)
    }

    pub fn inlines(&self) -> bool {
        self.opt_mode.contains(OptMode::INLINE)
    }
}

impl fmt::Display for DecisionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#x} heat {}", self.name, self.addr, self.heat)?;
        if self.reorders() {
            write!(f, ", reorder +{:#x}", self.branch_offset)?;
        }
        if self.inlines() {
            write!(f, ", inline {} at +{:#x}", self.inline_callee, self.inline_offset)?;
        }
        Ok(())
    }
}

/// Name and verdict of a profiled routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeInfo {
    pub name: String,
    pub verdict: ValidityVerdict,
}

/// Read access to the verdicts of all profiled routines.
pub trait CalleeLookup {
    fn callee(&self, addr: u64) -> Option<CalleeInfo>;
}

fn offset_in(profile: &RoutineProfile, addr: u64) -> Option<u32> {
    addr.checked_sub(profile.addr())
        .and_then(|off| u32::try_from(off).ok())
        .filter(|&off| off != 0)
}

/// Offset of the branch to reverse, 0 if no branch is biased enough.
pub fn reorder_offset(profile: &RoutineProfile, threshold: f64) -> u32 {
    let mut best: Option<(u64, u32)> = None;
    for branch in profile.branches() {
        let counts = branch.counts();
        let biased = counts.taken_ratio().is_some_and(|ratio| ratio >= threshold);
        if !biased {
            continue;
        }
        let Some(offset) = offset_in(profile, branch.addr()) else {
            continue;
        };
        if best.map_or(true, |(reached, _)| counts.reached > reached) {
            best = Some((counts.reached, offset));
        }
    }
    best.map_or(0, |(_, offset)| offset)
}

/// Offset and callee name of the call site to inline.
pub fn inline_candidate(
    profile: &RoutineProfile,
    lookup: &dyn CalleeLookup,
) -> Option<(u32, String)> {
    let mut best: Option<(u64, u32, String)> = None;
    for call in profile.calls() {
        let count = call.count();
        if count == 0 || best.as_ref().is_some_and(|(c, _, _)| count <= *c) {
            continue;
        }
        // Copying a routine into itself would still leave the recursive call.
        if call.callee_addr() == profile.addr() {
            continue;
        }
        let Some(callee) = lookup.callee(call.callee_addr()) else {
            continue;
        };
        if !callee.verdict.is_valid() {
            continue;
        }
        let Some(offset) = offset_in(profile, call.call_addr()) else {
            continue;
        };
        best = Some((count, offset, callee.name));
    }
    best.map(|(_, offset, name)| (offset, name))
}

/// Compute the decision record of a finished routine.
pub fn decide(
    profile: &RoutineProfile,
    lookup: &dyn CalleeLookup,
    threshold: f64,
) -> DecisionRecord {
    let branch_offset = reorder_offset(profile, threshold);
    let (inline_offset, callee) = inline_candidate(profile, lookup).unwrap_or_default();
    let record = DecisionRecord::new(
        profile.name(),
        profile.addr(),
        profile.heat(),
        branch_offset,
        inline_offset,
        callee,
    );
    log::debug!("decided {record}");
    record
}
