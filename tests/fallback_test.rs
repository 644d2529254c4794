//! Test that routines which cannot be rewritten are left as they are.

use pgr::core::{DecodeError, InsInfo, InstructionQuery, RewriteError, RoutineInfo};
use pgr::core::{Config, Translation};
use pgr::profile::{DecisionRecord, ProfileTable};
use pgr::rewrite::Rewriter;
use pgr::x64::CodeImage;

/// Fails to decode one address of an otherwise normal image.
struct Poisoned {
    image: CodeImage,
    bad: u64,
}

impl InstructionQuery for Poisoned {
    fn decode(&self, addr: u64) -> Result<InsInfo, DecodeError> {
        if addr == self.bad {
            return Err(DecodeError::InvalidInstruction { addr });
        }
        self.image.decode(addr)
    }

    fn routine_at(&self, addr: u64) -> Option<RoutineInfo> {
        self.image.routine_at(addr)
    }

    fn routine_by_name(&self, name: &str) -> Option<RoutineInfo> {
        self.image.routine_by_name(name)
    }

    fn routines(&self) -> Box<dyn Iterator<Item = RoutineInfo> + '_> {
        self.image.routines()
    }
}

fn image() -> CodeImage {
    let mut image = CodeImage::new();
    // nop; jrcxz +2; inc eax; ret
    image.add_routine_code("counted", 0x1000, vec![0x90, 0xE3, 0x02, 0xFF, 0xC0, 0xC3]);
    // xor eax, eax; inc eax; ret
    image.add_routine_code("plain", 0x2000, vec![0x31, 0xC0, 0xFF, 0xC0, 0xC3]);
    // nop; call callee; ret
    image.add_routine_code("caller", 0x3000, vec![0x90, 0xE8, 0xFA, 0x0F, 0x00, 0x00, 0xC3]);
    // xor eax, eax; ret
    image.add_routine_code("callee", 0x4000, vec![0x31, 0xC0, 0xC3]);
    image
}

fn profile() -> ProfileTable {
    let mut table = ProfileTable::new();
    table.insert(DecisionRecord::new("counted", 0x1000, 30, 1, 0, ""));
    table.insert(DecisionRecord::none("plain", 0x2000, 20));
    table.insert(DecisionRecord::new("caller", 0x3000, 10, 0, 1, "callee"));
    table
}

#[test]
fn decode_failure_leaves_the_routine_unmodified() {
    let _ = env_logger::builder().is_test(true).try_init();
    let query = Poisoned {
        image: image(),
        bad: 0x2002,
    };
    let session = Rewriter::new(&query, profile(), Config::new()).run();

    let plain = session.lookup(0x2000).unwrap();
    assert!(!plain.is_rewritten());
    match &plain.translation {
        Translation::Unmodified {
            reason: RewriteError::Decode(DecodeError::InvalidInstruction { addr }),
        } => assert_eq!(*addr, 0x2002),
        other => panic!("unexpected translation: {other:?}"),
    }
    assert!(session.lookup(0x1000).unwrap().is_rewritten());
    assert!(session.lookup(0x3000).unwrap().is_rewritten());
    assert_eq!(session.stats().routines_unmodified, 1);
    assert_eq!(session.stats().routines_rewritten, 2);
}

#[test]
fn unreadable_callee_aborts_the_caller() {
    let query = Poisoned {
        image: image(),
        bad: 0x4002,
    };
    let session = Rewriter::new(&query, profile(), Config::new()).run();
    let caller = session.lookup(0x3000).unwrap();
    assert!(matches!(
        caller.translation,
        Translation::Unmodified {
            reason: RewriteError::Decode(_)
        }
    ));
}

#[test]
fn counter_branch_keeps_its_layout() {
    let query = Poisoned {
        image: image(),
        bad: u64::MAX,
    };
    let session = Rewriter::new(&query, profile(), Config::new()).run();

    let counted = session.lookup(0x1000).unwrap();
    let map = counted.map().unwrap();
    assert!(!map.reordered());
    assert_eq!(map.orig_addrs(), [0x1000, 0x1001, 0x1003, 0x1005]);

    let caller = session.lookup(0x3000).unwrap().map().unwrap();
    assert!(caller.inlined());
    assert_eq!(caller.orig_addrs(), [0x3000, 0x4000, 0x3006]);
    assert_eq!(session.stats().callees_inlined, 1);
    assert_eq!(session.stats().branches_reordered, 0);
}
