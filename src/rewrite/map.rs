//! The instruction map: the rewritten routine as an ordered list of entries.

use std::fmt;

/// Where an entry of the map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Copied verbatim from the routine being rewritten.
    Copied,
    /// Copied verbatim from the inlined callee.
    Inlined,
    /// The reordered branch, with its condition inverted.
    ReversedBranch,
    /// The jump closing the relocated fall-through block.
    SyntheticJump,
}

/// One instruction of the rewritten stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionMapEntry {
    /// Sequential position in the map.
    pub position: usize,
    /// Address the instruction was copied from. Synthetic entries carry the
    /// address they stand in for.
    pub orig_addr: u64,
    /// Encoding, valid when placed at `orig_addr`.
    pub bytes: Vec<u8>,
    pub origin: EntryOrigin,
    /// Direct branch target in the original address space.
    pub orig_target: Option<u64>,
}

impl InstructionMapEntry {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// An original address that has no entry of its own, such as an inlined call
/// or the dropped return of the inlined callee. Branches to it land on the
/// entry at `position`, which may be one past the last entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alias {
    /// The address space of `orig_addr`: [`EntryOrigin::Copied`] for the
    /// routine itself, [`EntryOrigin::Inlined`] for the callee.
    pub origin: EntryOrigin,
    pub orig_addr: u64,
    pub position: usize,
}

/// A rewritten routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrMap {
    pub(crate) routine: String,
    pub(crate) addr: u64,
    pub(crate) entries: Vec<InstructionMapEntry>,
    pub(crate) aliases: Vec<Alias>,
    pub(crate) reordered: bool,
    pub(crate) inlined: bool,
}

impl InstrMap {
    pub fn routine(&self) -> &str {
        &self.routine
    }

    /// Entry address of the original routine.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn entries(&self) -> &[InstructionMapEntry] {
        &self.entries
    }

    pub fn aliases(&self) -> &[Alias] {
        &self.aliases
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total encoded size before linking.
    pub fn code_size(&self) -> usize {
        self.entries.iter().map(InstructionMapEntry::size).sum()
    }

    /// Whether a branch was reversed.
    pub fn reordered(&self) -> bool {
        self.reordered
    }

    /// Whether a callee was inlined.
    pub fn inlined(&self) -> bool {
        self.inlined
    }

    /// Original addresses in output order.
    pub fn orig_addrs(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.orig_addr).collect()
    }
}

impl fmt::Display for InstrMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} @ {:#x}:", self.routine, self.addr)?;
        for e in &self.entries {
            write!(f, "  [{:3}] {:#x} {:?}", e.position, e.orig_addr, e.origin)?;
            if let Some(t) = e.orig_target {
                write!(f, " -> {t:#x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
