// This module holds the profiling context, the table of every routine observed during the
// profiling pass. It replaces process-wide statistics tables with an explicit object that the
// host creates once and hands to every counter callback. Instrumenting a routine decodes it
// once through the instruction query service, classifies it for inlining and creates one
// counter per conditional branch and per direct call site. The table is only written on the
// first encounter of a routine (double-checked under a parking_lot RwLock); afterwards all
// callbacks go through an Arc<RoutineProfile> and touch atomic counters only. Finishing the
// pass consumes the context and yields one decision record per routine, hottest first.

//! The profiling pass state.

use crate::core::config::Config;
use crate::core::error::DecodeError;
use crate::core::query::{InsKind, InstructionQuery, RoutineInfo};
use crate::profile::decision::{decide, CalleeInfo, CalleeLookup, DecisionRecord};
use crate::profile::stats::{BranchStat, CallStat, RoutineProfile};
use crate::profile::validity::{classify_routine, ValidityVerdict};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

type RoutineTable = HashMap<u64, Arc<RoutineProfile>>;

/// Statistics of all routines seen by one profiling pass.
#[derive(Debug)]
pub struct ProfilingContext {
    routines: RwLock<RoutineTable>,
    max_calls: usize,
}

impl Default for ProfilingContext {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl ProfilingContext {
    pub fn new(config: &Config) -> Self {
        Self {
            routines: RwLock::new(HashMap::new()),
            max_calls: config.call_limit(),
        }
    }

    /// Number of routines seen so far.
    pub fn len(&self) -> usize {
        self.routines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.read().is_empty()
    }

    /// The profile of the routine entered at `addr`, if it was instrumented.
    pub fn routine(&self, addr: u64) -> Option<Arc<RoutineProfile>> {
        self.routines.read().get(&addr).cloned()
    }

    pub fn verdict_of(&self, addr: u64) -> Option<ValidityVerdict> {
        self.routines.read().get(&addr).map(|r| r.verdict())
    }

    /// Insert a profile built elsewhere. An existing profile at the same
    /// address wins and is returned.
    pub fn insert(&self, profile: RoutineProfile) -> Arc<RoutineProfile> {
        let mut table = self.routines.write();
        Arc::clone(
            table
                .entry(profile.addr())
                .or_insert_with(|| Arc::new(profile)),
        )
    }

    /// Instrument `routine` on its first encounter and return its profile.
    ///
    /// Later calls for the same routine return the existing profile without
    /// decoding anything.
    pub fn instrument_routine(
        &self,
        query: &dyn InstructionQuery,
        routine: &RoutineInfo,
    ) -> Result<Arc<RoutineProfile>, DecodeError> {
        if let Some(existing) = self.routine(routine.addr) {
            return Ok(existing);
        }

        let stream = query.routine_instructions(routine)?;
        let verdict = classify_routine(&routine.name, &stream, self.max_calls);

        let mut branches = Vec::new();
        let mut calls = Vec::new();
        for ins in &stream {
            match ins.kind {
                InsKind::CondJump { .. } => branches.push(BranchStat::new(ins.addr)),
                InsKind::DirectCall { target } => calls.push(CallStat::new(target, ins.addr)),
                _ => {}
            }
        }
        log::trace!(
            "instrumented {} ({} branches, {} calls, {verdict})",
            routine.name,
            branches.len(),
            calls.len()
        );

        // Another thread may have won the race while we were decoding.
        Ok(self.insert(RoutineProfile::new(
            routine.name.clone(),
            routine.addr,
            verdict,
            branches,
            calls,
        )))
    }

    /// End the profiling pass and produce the decision records, hottest
    /// routine first and by name on equal heat.
    pub fn finish(self, config: &Config) -> Vec<DecisionRecord> {
        let table = self.routines.into_inner();
        let mut records: Vec<DecisionRecord> = table
            .values()
            .map(|profile| decide(profile, &table, config.threshold()))
            .collect();
        records.sort_by(|a, b| b.heat().cmp(&a.heat()).then_with(|| a.name().cmp(b.name())));
        log::info!("profiled {} routines", records.len());
        records
    }
}

impl CalleeLookup for RoutineTable {
    fn callee(&self, addr: u64) -> Option<CalleeInfo> {
        self.get(&addr).map(|r| CalleeInfo {
            name: r.name().to_string(),
            verdict: r.verdict(),
        })
    }
}

impl CalleeLookup for ProfilingContext {
    fn callee(&self, addr: u64) -> Option<CalleeInfo> {
        self.routines.read().callee(addr)
    }
}
