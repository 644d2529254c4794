// This module rebuilds one routine as a new linear instruction map according to its decision
// record. The routine is decoded once through the instruction query service and walked with a
// single cursor. At the branch selected for reordering the builder emits the branch with its
// condition inverted, now targeting the old fall-through address, and moves the cursor to the
// old taken target so the likely path becomes the fall-through path. The skipped fall-through
// block is deferred: after the main stream it is copied in full and closed with an
// unconditional jump back to the taken target. At the call selected for inlining (in the main
// stream or inside the deferred block) the callee's body is copied in place of the call, minus
// its trailing return; the copied body is never rewritten further. Every decision is checked
// against the decoded code first. A decision that does not fit the code (an offset that is not
// an instruction boundary, a branch that cannot be inverted, a callee that is not inline-safe)
// is dropped with a warning and the instruction is copied verbatim. A decode failure aborts
// the rewrite and the working buffer is dropped with the error.

//! The instruction map builder.

use crate::core::config::Config;
use crate::core::error::{RewriteError, RewriteResult};
use crate::core::query::{InsInfo, InsKind, InstructionQuery, RoutineInfo};
use crate::profile::decision::DecisionRecord;
use crate::profile::validity::classify;
use crate::rewrite::map::{Alias, EntryOrigin, InstrMap, InstructionMapEntry};
use crate::x64::condition::ConditionCode;
use crate::x64::encoder::{conditional_jump, unconditional_jump};

/// How deep inlined code may nest. Inlined callee bodies are copied as they
/// are, so only one level is supported.
pub const MAX_INLINE_DEPTH: u32 = 1;

/// A validated reorder decision.
#[derive(Debug, Clone, Copy)]
struct ReorderPlan {
    /// Index of the branch in the stream.
    branch: usize,
    condition: ConditionCode,
    fall_through: u64,
    taken: u64,
    /// Index of the instruction at the taken target.
    taken_index: usize,
}

/// A validated inline decision.
#[derive(Debug)]
struct InlinePlan {
    call_addr: u64,
    /// The callee's instructions without its trailing return.
    body: Vec<InsInfo>,
    /// Address of the dropped return.
    exit_addr: u64,
}

/// Owns the map of one routine while it is being built.
#[derive(Debug)]
pub struct MapBuilder {
    routine: String,
    addr: u64,
    entries: Vec<InstructionMapEntry>,
    aliases: Vec<Alias>,
    reordered: bool,
    inlined: bool,
}

impl MapBuilder {
    pub fn new(routine: &RoutineInfo) -> Self {
        Self {
            routine: routine.name.clone(),
            addr: routine.addr,
            entries: Vec::new(),
            aliases: Vec::new(),
            reordered: false,
            inlined: false,
        }
    }

    fn push(&mut self, orig_addr: u64, bytes: Vec<u8>, origin: EntryOrigin, orig_target: Option<u64>) {
        let position = self.entries.len();
        log::trace!(
            "{}: [{position}] {origin:?} {orig_addr:#x} ({} bytes)",
            self.routine,
            bytes.len()
        );
        self.entries.push(InstructionMapEntry {
            position,
            orig_addr,
            bytes,
            origin,
            orig_target,
        });
    }

    /// Copy an instruction verbatim.
    pub fn copy(&mut self, ins: &InsInfo, origin: EntryOrigin) {
        self.push(ins.addr, ins.bytes.clone(), origin, ins.direct_target());
    }

    /// Emit `branch` with its condition inverted, jumping to `target`.
    pub fn reversed_branch(
        &mut self,
        branch: &InsInfo,
        condition: ConditionCode,
        target: u64,
    ) -> RewriteResult<()> {
        let bytes = conditional_jump(condition, branch.addr, target)?;
        self.push(branch.addr, bytes, EntryOrigin::ReversedBranch, Some(target));
        self.reordered = true;
        Ok(())
    }

    /// Emit an unconditional jump standing at `at` and going to `target`.
    pub fn jump(&mut self, at: u64, target: u64) -> RewriteResult<()> {
        let bytes = unconditional_jump(at, target)?;
        self.push(at, bytes, EntryOrigin::SyntheticJump, Some(target));
        Ok(())
    }

    fn alias(&mut self, origin: EntryOrigin, orig_addr: u64) {
        self.aliases.push(Alias {
            origin,
            orig_addr,
            position: self.entries.len(),
        });
    }

    /// Copy a callee body in place of the call at `call_addr`. Branches to
    /// `exit_addr`, the callee's return, continue after the body. `depth`
    /// is the nesting level of the copy.
    pub fn inline_body(
        &mut self,
        call_addr: u64,
        body: &[InsInfo],
        exit_addr: u64,
        depth: u32,
    ) -> RewriteResult<()> {
        if depth > MAX_INLINE_DEPTH {
            return Err(RewriteError::InlineDepthExceeded {
                depth,
                max: MAX_INLINE_DEPTH,
            });
        }
        self.alias(EntryOrigin::Copied, call_addr);
        for ins in body {
            self.copy(ins, EntryOrigin::Inlined);
        }
        self.alias(EntryOrigin::Inlined, exit_addr);
        self.inlined = true;
        Ok(())
    }

    /// Hand the finished map to the caller.
    pub fn finish(self) -> InstrMap {
        InstrMap {
            routine: self.routine,
            addr: self.addr,
            entries: self.entries,
            aliases: self.aliases,
            reordered: self.reordered,
            inlined: self.inlined,
        }
    }
}

fn index_of(stream: &[InsInfo], addr: u64) -> Option<usize> {
    stream.binary_search_by_key(&addr, |ins| ins.addr).ok()
}

fn plan_reorder(
    routine: &RoutineInfo,
    stream: &[InsInfo],
    decision: &DecisionRecord,
) -> Option<ReorderPlan> {
    if !decision.reorders() {
        return None;
    }
    let addr = routine.addr + u64::from(decision.branch_offset());
    let reject = |why: &str| {
        log::warn!(
            "{}: not reordering branch at +{:#x}: {why}",
            routine.name,
            decision.branch_offset()
        );
        None
    };

    let Some(branch) = index_of(stream, addr) else {
        return reject("not an instruction boundary");
    };
    let ins = &stream[branch];
    let (condition, taken) = match ins.kind {
        InsKind::CondJump { condition, target } => match condition.reversed() {
            Some(cc) => (cc, target),
            None => return reject("condition cannot be inverted"),
        },
        _ => return reject("not a conditional branch"),
    };
    let fall_through = ins.next_addr();
    if taken <= fall_through {
        // Backward branches and branches to the next instruction leave
        // nothing to defer.
        return reject("target does not skip forward");
    }
    let Some(taken_index) = index_of(stream, taken) else {
        return reject("target is outside the routine or inside an instruction");
    };
    Some(ReorderPlan {
        branch,
        condition,
        fall_through,
        taken,
        taken_index,
    })
}

fn plan_inline(
    query: &dyn InstructionQuery,
    routine: &RoutineInfo,
    stream: &[InsInfo],
    decision: &DecisionRecord,
    max_calls: usize,
) -> RewriteResult<Option<InlinePlan>> {
    if !decision.inlines() {
        return Ok(None);
    }
    let call_addr = routine.addr + u64::from(decision.inline_offset());
    let reject = |why: &str| {
        log::warn!(
            "{}: not inlining {} at +{:#x}: {why}",
            routine.name,
            decision.inline_callee(),
            decision.inline_offset()
        );
        Ok(None)
    };

    let Some(call) = index_of(stream, call_addr) else {
        return reject("not an instruction boundary");
    };
    let InsKind::DirectCall { target } = stream[call].kind else {
        return reject("not a direct call");
    };
    if target == routine.addr {
        return reject("recursive call");
    }
    let Some(callee) = query.routine_at(target) else {
        return reject("callee not found");
    };
    if callee.name != decision.inline_callee() {
        return reject("call goes elsewhere");
    }

    let mut body = query.routine_instructions(&callee)?;
    let verdict = classify(&body, max_calls);
    if !verdict.is_valid() {
        return reject(verdict.as_str());
    }
    // A valid routine ends in its only return.
    let exit_addr = body.pop().map_or(callee.end(), |ret| ret.addr);
    Ok(Some(InlinePlan {
        call_addr,
        body,
        exit_addr,
    }))
}

/// Rebuild `routine` according to `decision`.
///
/// On success the returned map holds the rewritten routine, with every entry
/// encoded as if it still lived at its original address. Use
/// [`crate::x64::link::link`] to place it elsewhere.
pub fn build_instr_map(
    query: &dyn InstructionQuery,
    routine: &RoutineInfo,
    decision: &DecisionRecord,
    config: &Config,
) -> RewriteResult<InstrMap> {
    let stream = query.routine_instructions(routine)?;
    if stream.is_empty() {
        return Err(RewriteError::EmptyRoutine { addr: routine.addr });
    }

    let reorder = plan_reorder(routine, &stream, decision);
    let inline = plan_inline(query, routine, &stream, decision, config.call_limit())?;

    let mut builder = MapBuilder::new(routine);
    let emit = |builder: &mut MapBuilder, ins: &InsInfo| -> RewriteResult<()> {
        match &inline {
            Some(plan) if plan.call_addr == ins.addr => {
                builder.inline_body(plan.call_addr, &plan.body, plan.exit_addr, 1)
            }
            _ => {
                builder.copy(ins, EntryOrigin::Copied);
                Ok(())
            }
        }
    };

    let mut cursor = 0;
    while cursor < stream.len() {
        let ins = &stream[cursor];
        match reorder {
            Some(plan) if plan.branch == cursor => {
                builder.reversed_branch(ins, plan.condition, plan.fall_through)?;
                cursor = plan.taken_index;
            }
            _ => {
                emit(&mut builder, ins)?;
                cursor += 1;
            }
        }
    }

    if let Some(plan) = reorder {
        let block_start = plan.branch + 1;
        let block_offset = plan.fall_through - routine.addr;
        // Position of the inline site relative to the deferred block.
        let inline_in_block = inline.as_ref().and_then(|p| {
            (p.call_addr - routine.addr).checked_sub(block_offset)
        });
        for ins in &stream[block_start..plan.taken_index] {
            match (&inline, inline_in_block) {
                (Some(p), Some(rel)) if ins.addr - plan.fall_through == rel => {
                    builder.inline_body(p.call_addr, &p.body, p.exit_addr, 1)?;
                }
                _ => builder.copy(ins, EntryOrigin::Copied),
            }
        }
        // The block ends where the taken target starts.
        builder.jump(plan.taken, plan.taken)?;
    }

    let map = builder.finish();
    log::debug!(
        "rewrote {} into {} entries (reordered: {}, inlined: {})",
        routine.name,
        map.len(),
        map.reordered(),
        map.inlined()
    );
    Ok(map)
}
