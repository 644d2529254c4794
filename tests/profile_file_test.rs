//! Test the profile file as written by a profiling pass and read back by a
//! rewriting pass.

use pgr::core::{Config, RunError};
use pgr::profile::format::{load_profile, parse_profile, save_profile};
use pgr::profile::{DecisionRecord, ProfilingContext, RoutineProfile, ValidityVerdict};
use pgr::profile::{BranchStat, CallStat, OptMode};
use pgr::rewrite::Rewriter;
use pgr::x64::CodeImage;
use pgr::RoutineInfo;
use std::fs;

#[test]
fn profile_round_trips_through_a_file() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profile_stat.csv");

    let records = vec![
        DecisionRecord::new("main", 0x401000, 900, 0x12, 0x30, "leaf"),
        DecisionRecord::new("leaf", 0x401200, 40, 0, 0, ""),
        DecisionRecord::none("cold", 0x401400, 0),
    ];
    save_profile(&path, &records).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(
        text,
        "main,0x401000,900,3,18,48,leaf\n\
         leaf,0x401200,40,0,0,0,\n\
         cold,0x401400,0,0,0,0,\n"
    );

    let table = load_profile(&path).unwrap();
    assert_eq!(table.rejected(), 0);
    let loaded: Vec<_> = table.iter().cloned().collect();
    assert_eq!(loaded, records);
    assert_eq!(table.get("main").unwrap().opt_mode(), OptMode::INLINE | OptMode::REORDER);
    assert_eq!(table.get("leaf").unwrap().inline_callee(), "");
}

#[test]
fn malformed_lines_give_the_all_zero_decision() {
    let input = "\
hot,0x1000,12,2,4,0,
bad_heat,0x2000,lots,0,0,0,
no_prefix,3000,1,0,0,0,
short,0x4000,1
liar,0x5000,1,1,0,0,
\r
";
    let table = parse_profile(input.as_bytes()).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.rejected(), 4);

    let mut image = CodeImage::new();
    image.add_routine_code("hot", 0x1000, vec![0x90, 0xC3]);
    image.add_routine_code("bad_heat", 0x2000, vec![0xC3]);
    let rewriter = Rewriter::new(&image, table, Config::new());

    let bad = RoutineInfo::new("bad_heat", 0x2000, 1);
    let decision = rewriter.decision_for(&bad);
    assert_eq!(decision, DecisionRecord::none("bad_heat", 0x2000, 0));
    assert!(decision.opt_mode().is_empty());

    let hot: Vec<_> = rewriter
        .hot_routines()
        .into_iter()
        .map(|(r, _)| r.name)
        .collect();
    assert_eq!(hot, ["hot"]);
}

#[test]
fn callee_names_keep_their_commas() {
    let table = parse_profile("f,0x10,1,1,0,4,operator,(int)\n".as_bytes()).unwrap();
    assert_eq!(table.get("f").unwrap().inline_callee(), "operator,(int)");
}

#[test]
fn missing_profile_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new();
    config.profile_path(dir.path().join("profile_stat.csv"));
    let image = CodeImage::new();
    match Rewriter::from_config(&image, config) {
        Err(RunError::MissingProfile { path }) => assert!(path.ends_with("profile_stat.csv")),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("rewriter built without a profile"),
    }
}

#[test]
fn equal_counts_keep_the_first_site() {
    let config = Config::new();
    let ctx = ProfilingContext::new(&config);
    for (addr, name) in [(0x2000, "g"), (0x3000, "h")] {
        ctx.insert(RoutineProfile::new(
            name,
            addr,
            ValidityVerdict::Valid,
            Vec::new(),
            Vec::new(),
        ));
    }
    ctx.insert(RoutineProfile::new(
        "f",
        0x1000,
        ValidityVerdict::MultipleCalls,
        vec![
            BranchStat::with_counts(0x1004, 90, 100),
            BranchStat::with_counts(0x1010, 90, 100),
        ],
        vec![
            CallStat::with_count(0x2000, 0x1020, 7),
            CallStat::with_count(0x3000, 0x1030, 7),
        ],
    ));

    let records = ctx.finish(&config);
    let f = records.iter().find(|r| r.name() == "f").unwrap();
    assert_eq!(f.branch_offset(), 0x4);
    assert_eq!(f.inline_offset(), 0x20);
    assert_eq!(f.inline_callee(), "g");
}
