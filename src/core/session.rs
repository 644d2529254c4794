// This module provides the rewrite session, the record of one rewriting pass. It owns the
// translation table: for every routine the pass looked at, the decision it was given and the
// outcome, either the rewritten instruction map (together with its linked code when the pass
// lays routines out in a code cache) or the reason the routine keeps running its original
// code. A routine whose rewrite failed is never half translated: it is recorded as unmodified
// and nothing of its partial map survives. SessionStats aggregates what the pass did (routines
// rewritten and left alone, branches reordered, callees inlined, code size before and after)
// and prints a summary at the end of a run.

//! Rewrite session and translation table.

use crate::core::error::RewriteError;
use crate::profile::decision::DecisionRecord;
use crate::rewrite::map::InstrMap;
use crate::x64::link::LinkedCode;
use hashbrown::HashMap;
use std::fmt;

/// Outcome of rewriting one routine.
#[derive(Debug, Clone)]
pub enum Translation {
    Rewritten {
        map: InstrMap,
        linked: Option<LinkedCode>,
    },
    /// The routine runs its original code.
    Unmodified { reason: RewriteError },
}

/// One entry of the translation table.
#[derive(Debug, Clone)]
pub struct TranslatedRoutine {
    pub name: String,
    pub addr: u64,
    pub size: u64,
    pub decision: DecisionRecord,
    pub translation: Translation,
}

impl TranslatedRoutine {
    pub fn is_rewritten(&self) -> bool {
        matches!(self.translation, Translation::Rewritten { .. })
    }

    pub fn map(&self) -> Option<&InstrMap> {
        match &self.translation {
            Translation::Rewritten { map, .. } => Some(map),
            Translation::Unmodified { .. } => None,
        }
    }

    pub fn linked(&self) -> Option<&LinkedCode> {
        match &self.translation {
            Translation::Rewritten { linked, .. } => linked.as_ref(),
            Translation::Unmodified { .. } => None,
        }
    }
}

/// Statistics of a rewrite pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub routines_rewritten: usize,
    pub routines_unmodified: usize,
    pub branches_reordered: usize,
    pub callees_inlined: usize,
    /// Bytes of the original routines that were rewritten.
    pub original_size: u64,
    /// Bytes of their rewritten maps.
    pub rewritten_size: u64,
    pub largest_routine_size: usize,
    pub largest_routine_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Rewrite Session Statistics:")?;
        writeln!(f, "  Routines rewritten: {}", self.routines_rewritten)?;
        writeln!(f, "  Routines unmodified: {}", self.routines_unmodified)?;
        writeln!(f, "  Branches reordered: {}", self.branches_reordered)?;
        writeln!(f, "  Callees inlined: {}", self.callees_inlined)?;
        writeln!(
            f,
            "  Code size: {} -> {} bytes",
            self.original_size, self.rewritten_size
        )?;
        if !self.largest_routine_name.is_empty() {
            writeln!(
                f,
                "  Largest routine: {} ({} bytes)",
                self.largest_routine_name, self.largest_routine_size
            )?;
        }
        Ok(())
    }
}

/// State of one rewriting pass.
#[derive(Debug, Default)]
pub struct RewriteSession {
    routines: Vec<TranslatedRoutine>,
    by_addr: HashMap<u64, usize>,
    stats: SessionStats,
}

impl RewriteSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a routine. A routine recorded twice keeps its
    /// first outcome.
    pub fn record(&mut self, routine: TranslatedRoutine) {
        if self.by_addr.contains_key(&routine.addr) {
            log::warn!("{} at {:#x} was already translated", routine.name, routine.addr);
            return;
        }
        match &routine.translation {
            Translation::Rewritten { map, .. } => {
                self.stats.routines_rewritten += 1;
                self.stats.branches_reordered += usize::from(map.reordered());
                self.stats.callees_inlined += usize::from(map.inlined());
                self.stats.original_size += routine.size;
                self.stats.rewritten_size += map.code_size() as u64;
                if map.code_size() > self.stats.largest_routine_size {
                    self.stats.largest_routine_size = map.code_size();
                    self.stats.largest_routine_name = routine.name.clone();
                }
            }
            Translation::Unmodified { reason } => {
                log::warn!("{} left unmodified: {reason}", routine.name);
                self.stats.routines_unmodified += 1;
            }
        }
        self.by_addr.insert(routine.addr, self.routines.len());
        self.routines.push(routine);
    }

    /// The translation of the routine entered at `addr`.
    pub fn lookup(&self, addr: u64) -> Option<&TranslatedRoutine> {
        self.by_addr.get(&addr).map(|&i| &self.routines[i])
    }

    /// Routines in the order they were translated.
    pub fn routines(&self) -> &[TranslatedRoutine] {
        &self.routines
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}
