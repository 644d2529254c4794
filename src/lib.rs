//! PGR - Profile-Guided Rewriting of x86-64 routines.
//!
//! PGR rebuilds hot routines of a program from the statistics of an earlier
//! run. A biased conditional branch is reversed so its likely target becomes
//! the fall-through path, and the hottest call to an inline-safe leaf routine
//! is replaced by the callee's body.
//!
//! # Primary Usage
//!
//! ```no_run
//! use pgr::core::Config;
//! use pgr::rewrite::Rewriter;
//!
//! let image = pgr::image::load_elf("a.out".as_ref())?;
//! let rewriter = Rewriter::from_config(&image, Config::new())?;
//! let session = rewriter.run();
//! print!("{}", session.stats());
//! # Ok::<(), pgr::core::RunError>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Shared infrastructure (query service, errors, config, session)
//! - [`profile`] - Profiling pass: statistics, classifier, decisions, profile file
//! - [`rewrite`] - Rewriting pass: instruction map builder and driver
//! - [`x64`] - x86-64 specific code (decoder, condition codes, encoder, linker)
//! - [`image`] - Executable loading

pub mod core;
pub mod image;
pub mod profile;
pub mod rewrite;
pub mod x64;

pub use crate::core::{Config, InstructionQuery, RewriteSession, RoutineInfo};
pub use crate::profile::{DecisionRecord, ProfilingContext, ValidityVerdict};
pub use crate::rewrite::{build_instr_map, InstrMap, Rewriter};
pub use crate::x64::CodeImage;
