// This test suite validates call-site inlining. The fixtures are a caller with two call
// sites, a single-exit leaf, a callee that itself makes two calls and a small helper. The
// classifier must accept the leaf and reject the busy callee under the default call limit,
// the decision must pick the hottest call whose callee is inline-safe even when a busier call
// exists, and the rewritten caller must hold the callee body without its return. A branch in
// the callee that went to that return must continue with the caller's next instruction once
// the routine is linked.

//! Test call-site inlining.
//!
//! These tests profile a caller and its callees, derive the decision from
//! the recorded call counts and check where the callee body ends up in the
//! rewritten caller.

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};
use pgr::core::{Config, InstructionQuery};
use pgr::profile::{ProfilingContext, ValidityVerdict};
use pgr::rewrite::{build_instr_map, EntryOrigin};
use pgr::x64::{link, CodeImage};

const CALLER: u64 = 0x40_1000;
const LEAF: u64 = 0x40_2000;
const BUSY: u64 = 0x40_3000;
const HELPER: u64 = 0x40_4000;

/// leaf: test edi, edi; jne done; mov eax, 1; done: ret
fn leaf() -> Result<Vec<u8>, IcedError> {
    let mut asm = CodeAssembler::new(64)?;
    let mut done = asm.create_label();
    asm.test(edi, edi)?;
    asm.jne(done)?;
    asm.mov(eax, 1)?;
    asm.set_label(&mut done)?;
    asm.ret()?;
    asm.assemble(LEAF)
}

/// busy: call helper; call helper; ret
fn busy() -> Result<Vec<u8>, IcedError> {
    let mut asm = CodeAssembler::new(64)?;
    asm.call(HELPER)?;
    asm.call(HELPER)?;
    asm.ret()?;
    asm.assemble(BUSY)
}

fn helper() -> Result<Vec<u8>, IcedError> {
    let mut asm = CodeAssembler::new(64)?;
    asm.xor(eax, eax)?;
    asm.ret()?;
    asm.assemble(HELPER)
}

/// caller: push rbx; call leaf; call busy; pop rbx; ret
/// Returns the code and the addresses of the two calls.
fn caller() -> Result<(Vec<u8>, u64, u64), IcedError> {
    let mut asm = CodeAssembler::new(64)?;
    let mut to_leaf = asm.create_label();
    let mut to_busy = asm.create_label();
    asm.push(rbx)?;
    asm.set_label(&mut to_leaf)?;
    asm.call(LEAF)?;
    asm.set_label(&mut to_busy)?;
    asm.call(BUSY)?;
    asm.pop(rbx)?;
    asm.ret()?;
    let result = asm.assemble_options(CALLER, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
    Ok((
        result.inner.code_buffer.clone(),
        result.label_ip(&to_leaf)?,
        result.label_ip(&to_busy)?,
    ))
}

struct Program {
    image: CodeImage,
    leaf_call: u64,
    busy_call: u64,
}

fn program() -> Program {
    let (code, leaf_call, busy_call) = caller().unwrap();
    let mut image = CodeImage::new();
    image.add_routine_code("caller", CALLER, code);
    image.add_routine_code("leaf", LEAF, leaf().unwrap());
    image.add_routine_code("busy", BUSY, busy().unwrap());
    image.add_routine_code("helper", HELPER, helper().unwrap());
    Program {
        image,
        leaf_call,
        busy_call,
    }
}

/// Instrument every routine and count `leaf_calls` and `busy_calls` for the
/// two call sites of the caller.
fn profile(program: &Program, config: &Config, leaf_calls: u64, busy_calls: u64) -> ProfilingContext {
    let ctx = ProfilingContext::new(config);
    let routines: Vec<_> = program.image.routines().collect();
    for routine in &routines {
        ctx.instrument_routine(&program.image, routine).unwrap();
    }
    let caller = ctx.routine(CALLER).unwrap();
    caller.add_heat(1000);
    for _ in 0..leaf_calls {
        caller.call_at(program.leaf_call).unwrap().record();
    }
    for _ in 0..busy_calls {
        caller.call_at(program.busy_call).unwrap().record();
    }
    ctx
}

#[test]
fn classifier_verdicts() {
    let program = program();
    let ctx = profile(&program, &Config::default(), 0, 0);
    assert_eq!(ctx.verdict_of(LEAF), Some(ValidityVerdict::Valid));
    assert_eq!(ctx.verdict_of(BUSY), Some(ValidityVerdict::MultipleCalls));
    assert_eq!(ctx.verdict_of(HELPER), Some(ValidityVerdict::Valid));
    assert_eq!(ctx.verdict_of(CALLER), Some(ValidityVerdict::MultipleCalls));
}

#[test]
fn hottest_valid_callee_is_inlined() {
    let _ = env_logger::builder().is_test(true).try_init();
    let program = program();
    let config = Config::default();
    // busy is called more often but may not be inlined.
    let ctx = profile(&program, &config, 10, 500);
    let records = ctx.finish(&config);
    let decision = records.iter().find(|r| r.name() == "caller").unwrap();
    assert!(decision.inlines());
    assert_eq!(decision.inline_callee(), "leaf");
    assert_eq!(u64::from(decision.inline_offset()), program.leaf_call - CALLER);

    let routine = program.image.routine_at(CALLER).unwrap();
    let map = build_instr_map(&program.image, &routine, decision, &config).unwrap();
    assert!(map.inlined());
    let leaf_stream = program
        .image
        .routine_instructions(&program.image.routine_at(LEAF).unwrap())
        .unwrap();
    let origins: Vec<_> = map.entries().iter().map(|e| e.origin).collect();
    assert_eq!(
        origins,
        [
            EntryOrigin::Copied,
            EntryOrigin::Inlined,
            EntryOrigin::Inlined,
            EntryOrigin::Inlined,
            EntryOrigin::Copied,
            EntryOrigin::Copied,
            EntryOrigin::Copied,
        ]
    );
    // Everything but the callee's return, in order.
    let inlined: Vec<_> = map.orig_addrs()[1..4].to_vec();
    let expected: Vec<_> = leaf_stream[..3].iter().map(|i| i.addr).collect();
    assert_eq!(inlined, expected);
    assert_eq!(map.entries()[4].orig_addr, program.busy_call);
}

#[test]
fn multiple_calls_callee_is_never_inlined() {
    let program = program();
    let config = Config::default();
    let ctx = profile(&program, &config, 0, 500);
    let records = ctx.finish(&config);
    let decision = records.iter().find(|r| r.name() == "caller").unwrap();
    assert!(!decision.inlines());
    assert_eq!(decision.inline_offset(), 0);
    assert_eq!(decision.inline_callee(), "");
}

#[test]
fn raised_call_limit_admits_busy() {
    let program = program();
    let mut config = Config::default();
    config.max_calls(2);
    let ctx = profile(&program, &config, 10, 500);
    assert_eq!(ctx.verdict_of(BUSY), Some(ValidityVerdict::Valid));
    let records = ctx.finish(&config);
    let decision = records.iter().find(|r| r.name() == "caller").unwrap();
    assert_eq!(decision.inline_callee(), "busy");

    // The calls copied out of busy are left as calls to helper.
    let routine = program.image.routine_at(CALLER).unwrap();
    let map = build_instr_map(&program.image, &routine, decision, &config).unwrap();
    let inlined: Vec<_> = map
        .entries()
        .iter()
        .filter(|e| e.origin == EntryOrigin::Inlined)
        .collect();
    assert_eq!(inlined.len(), 2);
    assert!(inlined.iter().all(|e| e.orig_target == Some(HELPER)));
}

#[test]
fn inlined_branch_lands_after_the_body() {
    let program = program();
    let config = Config::default();
    let ctx = profile(&program, &config, 10, 0);
    let records = ctx.finish(&config);
    let decision = records.iter().find(|r| r.name() == "caller").unwrap();
    let routine = program.image.routine_at(CALLER).unwrap();
    let map = build_instr_map(&program.image, &routine, decision, &config).unwrap();

    let base = 0x7f00_0000;
    let linked = link(&map, base).unwrap();
    let mut decoder = iced_x86::Decoder::with_ip(64, linked.bytes(), base, iced_x86::DecoderOptions::NONE);
    let code: Vec<_> = decoder.iter().collect();
    // push rbx; test; jne; mov; call busy; pop rbx; ret
    assert_eq!(code.len(), 7);
    // The callee's `jne done` skipped to its return, which is gone: it now
    // continues with the caller's next instruction.
    assert_eq!(code[2].near_branch_target(), code[4].ip());
    assert_eq!(code[4].near_branch_target(), BUSY);
}
