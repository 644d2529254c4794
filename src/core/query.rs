// This module defines the InstructionQuery trait, the seam between PGR and whatever host
// environment can decode machine code. The profiler and the rewriter never look at raw bytes
// themselves: they ask the service to decode the instruction at an address and get back an
// InsInfo describing its size, encoded bytes, control-flow category, direct target, branch
// condition and explicit memory operands. The service also knows the routines of the image
// (name, entry address, size) so the rewriter can locate an inline callee. The default host is
// x64::CodeImage, which implements the trait on top of iced-x86; tests use small fakes.

//! Instruction query service.
//!
//! The query service is the only way the rest of the crate learns about
//! machine code. It assumes:
//! - A routine is a contiguous address range `[addr, addr + size)`.
//! - Instructions inside a routine can be decoded linearly from its entry.
//! - Direct branch targets are reported as absolute addresses.

use crate::core::error::DecodeError;
use crate::x64::condition::Condition;

/// Which register a memory operand is based on, as far as frame safety is
/// concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseRegister {
    None,
    StackPointer,
    FramePointer,
    Other,
}

/// An explicit memory operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub read: bool,
    pub written: bool,
    pub base: BaseRegister,
    pub displacement: i64,
}

/// Control-flow category of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsKind {
    /// Falls through to the next instruction.
    Plain,
    Return,
    DirectCall { target: u64 },
    IndirectCall,
    Jump { target: u64 },
    CondJump { condition: Condition, target: u64 },
    IndirectJump,
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsInfo {
    pub addr: u64,
    pub bytes: Vec<u8>,
    pub kind: InsKind,
    pub mem_operands: Vec<MemOperand>,
}

impl InsInfo {
    pub fn new(addr: u64, bytes: Vec<u8>, kind: InsKind) -> Self {
        Self {
            addr,
            bytes,
            kind,
            mem_operands: Vec::new(),
        }
    }

    pub fn with_mem_operand(mut self, op: MemOperand) -> Self {
        self.mem_operands.push(op);
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Address of the instruction that follows this one in memory.
    pub fn next_addr(&self) -> u64 {
        self.addr + self.size()
    }

    pub fn is_return(&self) -> bool {
        self.kind == InsKind::Return
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, InsKind::DirectCall { .. } | InsKind::IndirectCall)
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self.kind, InsKind::IndirectCall | InsKind::IndirectJump)
    }

    /// Target of a direct jump or conditional jump. Calls are not branches.
    pub fn branch_target(&self) -> Option<u64> {
        match self.kind {
            InsKind::Jump { target } | InsKind::CondJump { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Target of any direct control transfer, calls included.
    pub fn direct_target(&self) -> Option<u64> {
        match self.kind {
            InsKind::DirectCall { target } => Some(target),
            _ => self.branch_target(),
        }
    }

    pub fn condition(&self) -> Option<Condition> {
        match self.kind {
            InsKind::CondJump { condition, .. } => Some(condition),
            _ => None,
        }
    }
}

/// A routine of the image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutineInfo {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

impl RoutineInfo {
    pub fn new(name: impl Into<String>, addr: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            addr,
            size,
        }
    }

    /// First address past the routine.
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

/// Host service that decodes instructions and knows the routines of an image.
pub trait InstructionQuery {
    /// Decode the instruction starting at `addr`.
    fn decode(&self, addr: u64) -> Result<InsInfo, DecodeError>;

    /// The routine whose entry point is `addr`.
    fn routine_at(&self, addr: u64) -> Option<RoutineInfo>;

    /// The routine called `name`.
    fn routine_by_name(&self, name: &str) -> Option<RoutineInfo>;

    /// All routines, in address order.
    fn routines(&self) -> Box<dyn Iterator<Item = RoutineInfo> + '_>;

    /// Decode a routine's full instruction stream, entry first.
    fn routine_instructions(&self, routine: &RoutineInfo) -> Result<Vec<InsInfo>, DecodeError> {
        let mut stream = Vec::new();
        let mut addr = routine.addr;
        while addr < routine.end() {
            let ins = self.decode(addr)?;
            // A zero-length decode would never advance.
            if ins.bytes.is_empty() {
                return Err(DecodeError::InvalidInstruction { addr });
            }
            addr = ins.next_addr();
            stream.push(ins);
        }
        Ok(stream)
    }
}
