// This module places a rewritten instruction map at its final address. Every entry is decoded
// again with iced at its original address, so branch targets and RIP-relative operands come
// back as absolute addresses, and then re-encoded at its new address. Short branches are
// widened to their rel32 form first so that the size of every entry is known before layout;
// entry addresses are then a prefix sum from the base. Direct jumps and conditional jumps whose
// original target is itself part of the map are retargeted to the new copy of that
// instruction. Lookups stay within one address space: code copied from the routine resolves
// against the routine's entries, inlined code against the inlined entries, because an inlined
// body carries the callee's original addresses. Calls and targets outside the map keep their
// absolute destination.

//! Layout and re-encoding of instruction maps.

use crate::core::error::{DecodeError, EncodeError, RewriteError, RewriteResult};
use crate::rewrite::map::{EntryOrigin, InstrMap};
use crate::x64::encoder::encode_at;
use hashbrown::HashMap;
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, OpKind};

/// A rewritten routine placed at its final address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedCode {
    base: u64,
    bytes: Vec<u8>,
    /// New address of each map entry, by position.
    addrs: Vec<u64>,
    /// (original address, new address) of the routine's own instructions.
    translations: Vec<(u64, u64)>,
}

impl LinkedCode {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// New address of the map entry at `position`.
    pub fn addr_of(&self, position: usize) -> Option<u64> {
        self.addrs.get(position).copied()
    }

    /// Where an instruction of the original routine ended up.
    pub fn translate(&self, orig_addr: u64) -> Option<u64> {
        self.translations
            .iter()
            .find(|(orig, _)| *orig == orig_addr)
            .map(|&(_, new)| new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    Routine,
    Inlined,
}

fn domain(origin: EntryOrigin) -> Domain {
    match origin {
        EntryOrigin::Inlined => Domain::Inlined,
        EntryOrigin::Copied | EntryOrigin::ReversedBranch | EntryOrigin::SyntheticJump => {
            Domain::Routine
        }
    }
}

fn decode_entry(bytes: &[u8], addr: u64) -> Result<Instruction, DecodeError> {
    let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() || instr.len() != bytes.len() {
        return Err(DecodeError::InvalidInstruction { addr });
    }
    Ok(instr)
}

/// Direct jumps and conditional jumps. Calls keep their target.
fn is_retargetable(instr: &Instruction) -> bool {
    matches!(
        instr.flow_control(),
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch
    ) && matches!(
        instr.op0_kind(),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
    )
}

/// Lay `map` out at `base` and re-encode it.
pub fn link(map: &InstrMap, base: u64) -> RewriteResult<LinkedCode> {
    let entries = map.entries();

    // Where each original address lives in the map, per domain. Synthetic
    // jumps reuse the address of the instruction they jump to and are left
    // out.
    let mut routine_index: HashMap<u64, usize> = HashMap::new();
    let mut inlined_index: HashMap<u64, usize> = HashMap::new();
    for entry in entries {
        match entry.origin {
            EntryOrigin::Copied | EntryOrigin::ReversedBranch => {
                routine_index.entry(entry.orig_addr).or_insert(entry.position);
            }
            EntryOrigin::Inlined => {
                inlined_index.entry(entry.orig_addr).or_insert(entry.position);
            }
            EntryOrigin::SyntheticJump => {}
        }
    }
    for alias in map.aliases() {
        let table = match domain(alias.origin) {
            Domain::Routine => &mut routine_index,
            Domain::Inlined => &mut inlined_index,
        };
        table.entry(alias.orig_addr).or_insert(alias.position);
    }

    let mut instrs = Vec::with_capacity(entries.len());
    let mut sizes = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut instr = decode_entry(&entry.bytes, entry.orig_addr)?;
        instr.as_near_branch();
        let size = encode_at(&instr, entry.orig_addr)?.len();
        instrs.push(instr);
        sizes.push(size);
    }

    let mut addrs = Vec::with_capacity(entries.len() + 1);
    let mut next = base;
    for &size in &sizes {
        addrs.push(next);
        next = next
            .checked_add(size as u64)
            .ok_or(RewriteError::AddressOverflow { base })?;
    }
    // A position one past the last entry resolves to the end of the code.
    addrs.push(next);

    let mut bytes = Vec::with_capacity((next - base) as usize);
    for ((entry, instr), &size) in entries.iter().zip(instrs.iter_mut()).zip(&sizes) {
        let at = addrs[entry.position];
        if is_retargetable(instr) {
            let table = match domain(entry.origin) {
                Domain::Routine => &routine_index,
                Domain::Inlined => &inlined_index,
            };
            let target = instr.near_branch_target();
            if let Some(&position) = table.get(&target) {
                instr.set_near_branch64(addrs[position]);
            }
        }
        let encoded = encode_at(instr, at)?;
        if encoded.len() != size {
            return Err(EncodeError::SizeChanged {
                addr: entry.orig_addr,
                expected: size,
                actual: encoded.len(),
            }
            .into());
        }
        bytes.extend_from_slice(&encoded);
    }

    let translations = routine_index
        .iter()
        .map(|(&orig, &position)| (orig, addrs[position]))
        .collect();
    addrs.pop();
    log::debug!(
        "linked {} at {base:#x} ({} bytes)",
        map.routine(),
        bytes.len()
    );
    Ok(LinkedCode {
        base,
        bytes,
        addrs,
        translations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::query::InstructionQuery;
    use crate::profile::decision::DecisionRecord;
    use crate::rewrite::builder::build_instr_map;
    use crate::x64::decoder::CodeImage;

    const RTN: u64 = 0x40_1000;
    const CACHE: u64 = 0x7000_0000;

    fn decode_all(code: &LinkedCode) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(64, code.bytes(), code.base(), DecoderOptions::NONE);
        decoder.iter().collect()
    }

    #[test]
    fn copy_in_place_reproduces_the_routine() {
        let bytes = vec![0x90, 0x85, 0xC0, 0x0F, 0x84, 0x02, 0x00, 0x00, 0x00, 0xFF, 0xC0, 0xC3];
        let mut image = CodeImage::new();
        image.add_routine_code("f", RTN, bytes.clone());
        let rtn = image.routine_at(RTN).unwrap();
        let map = build_instr_map(
            &image,
            &rtn,
            &DecisionRecord::none("f", RTN, 0),
            &Config::default(),
        )
        .unwrap();
        let linked = link(&map, RTN).unwrap();
        assert_eq!(linked.bytes(), bytes);
    }

    #[test]
    fn code_past_the_address_space_fails() {
        let mut image = CodeImage::new();
        image.add_routine_code("f", RTN, vec![0x31, 0xC0, 0xFF, 0xC0, 0xC3]);
        let rtn = image.routine_at(RTN).unwrap();
        let map = build_instr_map(
            &image,
            &rtn,
            &DecisionRecord::none("f", RTN, 0),
            &Config::default(),
        )
        .unwrap();
        let base = u64::MAX - 2;
        assert_eq!(link(&map, base), Err(RewriteError::AddressOverflow { base }));
    }

    #[test]
    fn relocated_branches_follow_their_targets() {
        // nop; test eax, eax; je D; inc eax (C); inc ecx (D); ret
        let mut image = CodeImage::new();
        image.add_routine_code(
            "f",
            RTN,
            vec![0x90, 0x85, 0xC0, 0x74, 0x02, 0xFF, 0xC0, 0xFF, 0xC1, 0xC3],
        );
        let rtn = image.routine_at(RTN).unwrap();
        let decision = DecisionRecord::new("f", RTN, 100, 3, 0, "");
        let map = build_instr_map(&image, &rtn, &decision, &Config::default()).unwrap();
        let linked = link(&map, CACHE).unwrap();

        // nop(1) test(2) jne(6) inc ecx(2) ret(1) inc eax(2) jmp(5)
        assert_eq!(linked.len(), 19);
        let code = decode_all(&linked);
        assert_eq!(code.len(), 7);
        let c = linked.translate(RTN + 5).unwrap();
        let d = linked.translate(RTN + 7).unwrap();
        assert_eq!(c, CACHE + 12);
        assert_eq!(d, CACHE + 9);
        assert_eq!(code[2].near_branch_target(), c);
        assert_eq!(code[6].near_branch_target(), d);
        assert_eq!(linked.addr_of(6), Some(CACHE + 14));
        assert_eq!(linked.translate(RTN), Some(CACHE));
    }

    #[test]
    fn calls_and_rip_relative_operands_keep_absolute_targets() {
        // call 0x402000; mov eax, [rip+0x100]; ret
        let mut bytes = vec![0xE8];
        bytes.extend_from_slice(&((0x40_2000u64 - (RTN + 5)) as u32).to_le_bytes());
        bytes.extend_from_slice(&[0x8B, 0x05, 0x00, 0x01, 0x00, 0x00, 0xC3]);
        let mut image = CodeImage::new();
        image.add_routine_code("f", RTN, bytes);
        let rtn = image.routine_at(RTN).unwrap();
        let map = build_instr_map(
            &image,
            &rtn,
            &DecisionRecord::none("f", RTN, 0),
            &Config::default(),
        )
        .unwrap();
        let linked = link(&map, CACHE).unwrap();
        let code = decode_all(&linked);
        assert_eq!(code[0].near_branch_target(), 0x40_2000);
        assert_eq!(code[1].memory_displacement64(), RTN + 11 + 0x100);
    }

    #[test]
    fn inlined_branches_stay_inside_the_inlined_body() {
        // caller: call leaf; ret
        // leaf: test eax, eax; je +2; inc eax; ret
        let leaf = 0x40_2000u64;
        let mut caller = vec![0x90, 0xE8];
        caller.extend_from_slice(&((leaf - (RTN + 6)) as u32).to_le_bytes());
        caller.push(0xC3);
        let mut image = CodeImage::new();
        image.add_routine_code("f", RTN, caller);
        image.add_routine_code("leaf", leaf, vec![0x85, 0xC0, 0x74, 0x02, 0xFF, 0xC0, 0xC3]);
        let rtn = image.routine_at(RTN).unwrap();
        let decision = DecisionRecord::new("f", RTN, 100, 0, 1, "leaf");
        let map = build_instr_map(&image, &rtn, &decision, &Config::default()).unwrap();
        let linked = link(&map, CACHE).unwrap();

        // nop(1) test(2) je(6) inc eax(2) ret(1)
        let code = decode_all(&linked);
        assert_eq!(code.len(), 5);
        // The branch to the callee's return now lands on the caller's ret.
        assert_eq!(code[2].near_branch_target(), CACHE + 11);
        assert_eq!(linked.translate(RTN + 1), Some(CACHE + 1));
    }
}
