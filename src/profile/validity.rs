// This module implements the inline-safety classifier. A routine can be copied bodily into a
// caller only if it has exactly one exit point at its very end, never transfers control
// through an unresolvable target or outside its own address range, does not address memory
// below its stack pointer or above its saved frame pointer (both break once its frame is merged
// into the caller's), and makes at most a configured number of calls. The checks run in a
// fixed priority order and the first failing check decides the verdict, so a routine is
// always reported the same way regardless of where in its body the offending instructions sit.

//! Inline-safety classification of routines.

use crate::core::query::{BaseRegister, InsInfo};
use std::fmt;

/// Outcome of classifying a routine for inlining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidityVerdict {
    Valid,
    LastInstructionNotReturn,
    MultipleReturns,
    IndirectControlFlowPresent,
    ControlFlowLeavesRoutine,
    InvalidFrameRelativeMemoryOffset,
    MultipleCalls,
}

impl ValidityVerdict {
    pub fn is_valid(self) -> bool {
        self == ValidityVerdict::Valid
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidityVerdict::Valid => "VALID",
            ValidityVerdict::LastInstructionNotReturn => "LAST_INSTRUCTION_NOT_RETURN",
            ValidityVerdict::MultipleReturns => "MULTIPLE_RETURNS",
            ValidityVerdict::IndirectControlFlowPresent => "INDIRECT_CONTROL_FLOW_PRESENT",
            ValidityVerdict::ControlFlowLeavesRoutine => "CONTROL_FLOW_LEAVES_ROUTINE",
            ValidityVerdict::InvalidFrameRelativeMemoryOffset => {
                "INVALID_FRAME_RELATIVE_MEMORY_OFFSET"
            }
            ValidityVerdict::MultipleCalls => "MULTIPLE_CALLS",
        }
    }
}

impl fmt::Display for ValidityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negative offsets from the stack pointer address the red zone, positive
/// offsets from the frame pointer reach into the caller's frame.
fn has_invalid_frame_offset(ins: &InsInfo) -> bool {
    ins.mem_operands.iter().any(|op| {
        (op.read || op.written)
            && match op.base {
                BaseRegister::StackPointer => op.displacement < 0,
                BaseRegister::FramePointer => op.displacement > 0,
                BaseRegister::None | BaseRegister::Other => false,
            }
    })
}

/// Classify a routine's instruction stream, entry first.
///
/// `max_calls` is the number of call instructions the routine may contain.
pub fn classify(stream: &[InsInfo], max_calls: usize) -> ValidityVerdict {
    let (start, end) = match (stream.first(), stream.last()) {
        (Some(first), Some(last)) if last.is_return() => (first.addr, last.addr),
        _ => return ValidityVerdict::LastInstructionNotReturn,
    };

    if stream.iter().filter(|ins| ins.is_return()).count() > 1 {
        return ValidityVerdict::MultipleReturns;
    }

    if stream.iter().any(|ins| ins.is_indirect()) {
        return ValidityVerdict::IndirectControlFlowPresent;
    }

    let leaves = stream
        .iter()
        .filter_map(InsInfo::branch_target)
        .any(|target| target < start || target > end);
    if leaves {
        return ValidityVerdict::ControlFlowLeavesRoutine;
    }

    if stream.iter().any(has_invalid_frame_offset) {
        return ValidityVerdict::InvalidFrameRelativeMemoryOffset;
    }

    if stream.iter().filter(|ins| ins.is_call()).count() > max_calls {
        return ValidityVerdict::MultipleCalls;
    }

    ValidityVerdict::Valid
}

/// Classify a routine and log why it was rejected.
pub fn classify_routine(name: &str, stream: &[InsInfo], max_calls: usize) -> ValidityVerdict {
    let verdict = classify(stream, max_calls);
    if !verdict.is_valid() {
        log::debug!("{name}: {verdict}");
    }
    verdict
}
