//! Synthesis of the instructions the rewriter adds to a routine.
//!
//! Everything emitted here uses the `rel32` form so its size does not depend
//! on where the target ends up: a `Jcc rel32` is six bytes, a `JMP rel32` five.

use crate::core::error::EncodeError;
use crate::x64::condition::ConditionCode;
use iced_x86::{Code, Encoder, IcedError, Instruction};

fn iced_err(addr: u64) -> impl FnOnce(IcedError) -> EncodeError {
    move |e| EncodeError::Iced {
        addr,
        reason: e.to_string(),
    }
}

/// Encode `instr` as if it were placed at `ip`.
pub fn encode_at(instr: &Instruction, ip: u64) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::new(64);
    encoder.encode(instr, ip).map_err(iced_err(ip))?;
    Ok(encoder.take_buffer())
}

fn branch(code: Code, at: u64, target: u64) -> Result<Vec<u8>, EncodeError> {
    let instr = Instruction::with_branch(code, target).map_err(iced_err(at))?;
    encode_at(&instr, at)
}

/// A conditional jump testing `cc`, placed at `at` and jumping to `target`.
pub fn conditional_jump(cc: ConditionCode, at: u64, target: u64) -> Result<Vec<u8>, EncodeError> {
    branch(cc.near_code(), at, target)
}

/// An unconditional jump placed at `at` and jumping to `target`.
pub fn unconditional_jump(at: u64, target: u64) -> Result<Vec<u8>, EncodeError> {
    branch(Code::Jmp_rel32_64, at, target)
}
