// This module contains the profiling side of PGR: the per-routine statistics a profiling pass
// collects (stats), the context object that owns them while the target runs (context), the
// inline-safety classifier applied to every instrumented routine (validity), the selection of
// the branch to reorder and the call site to inline (decision), and the CSV file the results
// are persisted to for the rewriting pass (format).

pub mod context;
pub mod decision;
pub mod format;
pub mod stats;
pub mod validity;

pub use context::ProfilingContext;
pub use decision::{decide, CalleeInfo, CalleeLookup, DecisionRecord, OptMode};
pub use format::{load_profile, parse_profile, save_profile, ProfileTable, PROFILE_FILE_NAME};
pub use stats::{BranchCounts, BranchStat, CallStat, RoutineProfile};
pub use validity::{classify, ValidityVerdict};
