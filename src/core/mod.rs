// This module serves as the central hub for PGR's shared infrastructure. It exports the
// instruction query service (the InstructionQuery trait through which the profiler and the
// rewriter learn about machine code, with the InsInfo and RoutineInfo descriptions it hands
// out), the error taxonomy, the run configuration, and the rewrite session that records the
// outcome of every routine a pass translates.

//! Core PGR infrastructure.
//!
//! # Key Components
//!
//! ## Instruction Query Service (`query`)
//! - Decoding of single instructions and whole routines
//! - Routine lookup by entry address and by name
//!
//! ## Errors (`error`)
//! - Per-instruction, per-routine, per-line and per-run failures
//!
//! ## Configuration (`config`)
//! - Bias threshold, call limit, hot routine limit, file locations
//!
//! ## Session (`session`)
//! - Translation table and rewrite statistics

pub mod config;
pub mod error;
pub mod query;
pub mod session;

pub use config::Config;
pub use error::{
    DecodeError, EncodeError, ImageError, ProfileError, RewriteError, RewriteResult, RunError,
};
pub use query::{BaseRegister, InsInfo, InsKind, InstructionQuery, MemOperand, RoutineInfo};
pub use session::{RewriteSession, SessionStats, TranslatedRoutine, Translation};
