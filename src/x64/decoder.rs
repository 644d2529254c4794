// This module implements the default instruction query service on top of iced-x86. A CodeImage
// is a set of executable segments (an address and the bytes mapped there) plus the routine
// table of the image. Decoding an address finds the segment holding it, runs iced's 64-bit
// Decoder from that offset, and translates the result into the crate's InsInfo: the
// FlowControl class becomes an InsKind (direct targets resolved from the near-branch operand,
// a syscall is treated as plain code), the mnemonic of a conditional branch becomes a
// Condition, and InstructionInfoFactory supplies read/write access for each explicit memory
// operand so the validity classifier can look at stack and frame based addressing.

//! iced-x86 backed [`InstructionQuery`] implementation.

use crate::core::error::DecodeError;
use crate::core::query::{BaseRegister, InsInfo, InsKind, InstructionQuery, MemOperand, RoutineInfo};
use crate::x64::condition::Condition;
use iced_x86::{
    Code, Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, OpAccess,
    OpKind, Register,
};

/// Bytes mapped at an address.
#[derive(Debug, Clone)]
pub struct CodeSegment {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

impl CodeSegment {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.bytes.len() as u64
    }
}

/// The code of an executable image and its routine table.
#[derive(Debug, Clone, Default)]
pub struct CodeImage {
    segments: Vec<CodeSegment>,
    /// Sorted by entry address.
    routines: Vec<RoutineInfo>,
}

impl CodeImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `addr`.
    pub fn add_segment(&mut self, addr: u64, bytes: Vec<u8>) {
        self.segments.push(CodeSegment { addr, bytes });
    }

    /// Register a routine. A second routine at an address already known is
    /// ignored.
    pub fn add_routine(&mut self, routine: RoutineInfo) {
        match self.routines.binary_search_by_key(&routine.addr, |r| r.addr) {
            Ok(_) => log::trace!("ignoring alias {} at {:#x}", routine.name, routine.addr),
            Err(pos) => self.routines.insert(pos, routine),
        }
    }

    /// Map a routine's code and register it in one go.
    pub fn add_routine_code(&mut self, name: &str, addr: u64, bytes: Vec<u8>) {
        let size = bytes.len() as u64;
        self.add_segment(addr, bytes);
        self.add_routine(RoutineInfo::new(name, addr, size));
    }

    pub fn routine_count(&self) -> usize {
        self.routines.len()
    }

    /// Raw bytes starting at `addr`, up to the end of its segment.
    pub fn bytes_at(&self, addr: u64) -> Option<&[u8]> {
        self.segments
            .iter()
            .find(|s| s.contains(addr))
            .map(|s| &s.bytes[(addr - s.addr) as usize..])
    }
}

impl InstructionQuery for CodeImage {
    fn decode(&self, addr: u64) -> Result<InsInfo, DecodeError> {
        let bytes = self.bytes_at(addr).ok_or(DecodeError::Unmapped { addr })?;
        let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(DecodeError::InvalidInstruction { addr });
        }
        Ok(describe(&instr, &bytes[..instr.len()]))
    }

    fn routine_at(&self, addr: u64) -> Option<RoutineInfo> {
        self.routines
            .binary_search_by_key(&addr, |r| r.addr)
            .ok()
            .map(|i| self.routines[i].clone())
    }

    fn routine_by_name(&self, name: &str) -> Option<RoutineInfo> {
        self.routines.iter().find(|r| r.name == name).cloned()
    }

    fn routines(&self) -> Box<dyn Iterator<Item = RoutineInfo> + '_> {
        Box::new(self.routines.iter().cloned())
    }
}

/// Translate a decoded iced instruction into an [`InsInfo`].
pub fn describe(instr: &Instruction, bytes: &[u8]) -> InsInfo {
    let kind = match instr.flow_control() {
        FlowControl::Return => InsKind::Return,
        FlowControl::Call if instr.code() == Code::Syscall => InsKind::Plain,
        FlowControl::Call => match near_target(instr) {
            Some(target) => InsKind::DirectCall { target },
            None => InsKind::IndirectCall,
        },
        FlowControl::IndirectCall => InsKind::IndirectCall,
        FlowControl::UnconditionalBranch => match near_target(instr) {
            Some(target) => InsKind::Jump { target },
            // Far jumps cannot be followed statically.
            None => InsKind::IndirectJump,
        },
        FlowControl::IndirectBranch => InsKind::IndirectJump,
        FlowControl::ConditionalBranch => match near_target(instr) {
            Some(target) => InsKind::CondJump {
                condition: Condition::from_mnemonic(instr.mnemonic()),
                target,
            },
            None => InsKind::IndirectJump,
        },
        _ => InsKind::Plain,
    };

    let mut info = InsInfo::new(instr.ip(), bytes.to_vec(), kind);
    info.mem_operands = mem_operands(instr);
    info
}

fn near_target(instr: &Instruction) -> Option<u64> {
    match instr.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instr.near_branch_target())
        }
        _ => None,
    }
}

fn base_register(reg: Register) -> BaseRegister {
    match reg {
        Register::None => BaseRegister::None,
        Register::RSP | Register::ESP => BaseRegister::StackPointer,
        Register::RBP | Register::EBP => BaseRegister::FramePointer,
        _ => BaseRegister::Other,
    }
}

/// The signed displacement of the memory operand. iced zero-extends the
/// displacement of a 32-bit address.
fn displacement(instr: &Instruction) -> i64 {
    if instr.memory_base().size() == 4 {
        i64::from(instr.memory_displacement32() as i32)
    } else {
        instr.memory_displacement64() as i64
    }
}

fn mem_operands(instr: &Instruction) -> Vec<MemOperand> {
    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(instr);
    (0..instr.op_count())
        .filter(|&i| instr.op_kind(i) == OpKind::Memory)
        .map(|i| {
            let access = info.op_access(i);
            MemOperand {
                read: matches!(
                    access,
                    OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
                ),
                written: matches!(
                    access,
                    OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
                ),
                base: base_register(instr.memory_base()),
                displacement: displacement(instr),
            }
        })
        .collect()
}
