// This module defines the error types for PGR using the thiserror crate. The taxonomy follows
// how far a failure reaches: DecodeError and EncodeError come from the instruction service and
// are local to one instruction; RewriteError wraps them together with the rewriter's own
// failures and is local to one routine (the routine then runs unmodified); ProfileError
// describes a single malformed profile line, which is dropped; RunError covers file-level
// failures (missing profile, unreadable binary, bad configuration) that abort the whole run
// before any routine is touched.

//! Error types for PGR.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The instruction service could not interpret the bytes at an address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no code is mapped at {addr:#x}")]
    Unmapped { addr: u64 },

    #[error("invalid instruction bytes at {addr:#x}")]
    InvalidInstruction { addr: u64 },
}

/// An instruction could not be produced in machine code form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("failed to encode instruction for {addr:#x}: {reason}")]
    Iced { addr: u64, reason: String },

    #[error("instruction from {addr:#x} changed size from {expected} to {actual} bytes during layout")]
    SizeChanged {
        addr: u64,
        expected: usize,
        actual: usize,
    },
}

/// A routine rewrite failed. The routine falls back to its original code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("routine at {addr:#x} has no instructions")]
    EmptyRoutine { addr: u64 },

    #[error("inlining depth {depth} exceeds the supported maximum of {max}")]
    InlineDepthExceeded { depth: u32, max: u32 },

    #[error("code placed at {base:#x} runs past the end of the address space")]
    AddressOverflow { base: u64 },
}

/// A profile line could not be turned into a decision record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("line {line}: expected 7 fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: invalid {field} `{value}`")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: opt_mode {opt_mode} does not agree with the recorded offsets")]
    InconsistentMode { line: usize, opt_mode: u8 },
}

/// An executable could not be read as an x86-64 image.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error(transparent)]
    Object(#[from] object::Error),

    #[error("unsupported architecture {0:?}")]
    Architecture(object::Architecture),

    #[error("no executable code")]
    NoCode,
}

/// A failure that aborts the whole run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("profile file {} not found; run the profiling pass first", path.display())]
    MissingProfile { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot load image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for routine rewrites.
pub type RewriteResult<T> = Result<T, RewriteError>;
