//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction decoding into the query service's descriptions using iced-x86
//! - Conditional branch kinds and their reversal table
//! - Synthesis of the rel32 branches the rewriter adds
//! - Layout and re-encoding of rewritten routines
//! - NASM syntax listings for `--dump`

pub mod condition;
pub mod decoder;
pub mod disasm;
pub mod encoder;
pub mod link;

pub use condition::{Condition, ConditionCode};
pub use decoder::CodeImage;
pub use link::{link, LinkedCode};
