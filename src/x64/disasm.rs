//! Disassembly listings of rewritten code.

use crate::rewrite::map::InstrMap;
use crate::x64::link::LinkedCode;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use std::fmt::Write;

fn formatter() -> NasmFormatter {
    let mut fmtr = NasmFormatter::new();
    fmtr.options_mut().set_branch_leading_zeros(false);
    fmtr.options_mut().set_hex_prefix("0x");
    fmtr.options_mut().set_hex_suffix("");
    fmtr.options_mut().set_show_branch_size(false);
    fmtr.options_mut().set_space_after_operand_separator(true);
    fmtr
}

/// Disassemble `bytes` as if mapped at `ip`, one instruction per line.
pub fn disassemble(bytes: &[u8], ip: u64) -> Vec<String> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut fmtr = formatter();
    let mut instr = Instruction::default();
    let mut lines = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        let mut text = String::new();
        fmtr.format(&instr, &mut text);
        lines.push(format!("{:x}: {text}", instr.ip()));
    }
    lines
}

/// A listing of a map before linking, each entry at its original address.
pub fn map_listing(map: &InstrMap) -> String {
    let mut fmtr = formatter();
    let mut out = String::new();
    let _ = writeln!(out, "{} @ {:#x}:", map.routine(), map.addr());
    for entry in map.entries() {
        let mut decoder = Decoder::with_ip(64, &entry.bytes, entry.orig_addr, DecoderOptions::NONE);
        let instr = decoder.decode();
        let mut text = String::new();
        fmtr.format(&instr, &mut text);
        let _ = writeln!(
            out,
            "  [{:3}] {:x}: {text:<32} ; {:?}",
            entry.position, entry.orig_addr, entry.origin
        );
    }
    out
}

/// A listing of linked code at its final address.
pub fn linked_listing(map: &InstrMap, code: &LinkedCode) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} @ {:#x} -> {:#x}:", map.routine(), map.addr(), code.base());
    for line in disassemble(code.bytes(), code.base()) {
        let _ = writeln!(out, "  {line}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_nasm_syntax() {
        let lines = disassemble(&[0x31, 0xC0, 0x0F, 0x85, 0x00, 0x00, 0x00, 0x00, 0xC3], 0x1000);
        assert_eq!(lines, ["1000: xor eax, eax", "1002: jne 0x1008", "1008: ret"]);
    }
}
