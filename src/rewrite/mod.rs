//! The rewriting pass.
//!
//! [`builder`] turns a routine and its decision record into an [`InstrMap`];
//! [`driver`] runs the builder over the hot routines of an image.

pub mod builder;
pub mod driver;
pub mod map;

pub use builder::{build_instr_map, MapBuilder, MAX_INLINE_DEPTH};
pub use driver::Rewriter;
pub use map::{Alias, EntryOrigin, InstrMap, InstructionMapEntry};
