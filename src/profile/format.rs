//! The persisted profile: one CSV line per routine.
//!
//! ```text
//! <name>,0x<addr hex>,<heat>,<opt_mode>,<branch_offset>,<inline_offset>,<inline_callee>
//! ```
//!
//! The callee name is the last field and may be empty. Routine names cannot
//! contain a comma; the callee name is taken verbatim up to the end of the
//! line.

use crate::core::error::{ProfileError, RunError};
use crate::profile::decision::DecisionRecord;
use hashbrown::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// Default profile file name, relative to the working directory.
pub const PROFILE_FILE_NAME: &str = "profile_stat.csv";

const FIELD_COUNT: usize = 7;

/// Render one record as a profile line, without the line terminator.
pub fn format_record(record: &DecisionRecord) -> String {
    format!(
        "{},{:#x},{},{},{},{},{}",
        record.name(),
        record.addr(),
        record.heat(),
        record.opt_mode().bits(),
        record.branch_offset(),
        record.inline_offset(),
        record.inline_callee()
    )
}

fn number<T: FromStr>(line: usize, field: &'static str, value: &str) -> Result<T, ProfileError> {
    value.parse().map_err(|_| ProfileError::InvalidField {
        line,
        field,
        value: value.to_string(),
    })
}

/// Parse one profile line. `line_no` is only used in errors.
pub fn parse_record(line: &str, line_no: usize) -> Result<DecisionRecord, ProfileError> {
    let fields: Vec<&str> = line.splitn(FIELD_COUNT, ',').collect();
    if fields.len() != FIELD_COUNT {
        return Err(ProfileError::FieldCount {
            line: line_no,
            found: fields.len(),
        });
    }

    let name = fields[0];
    if name.is_empty() {
        return Err(ProfileError::InvalidField {
            line: line_no,
            field: "name",
            value: String::new(),
        });
    }
    let addr = fields[1]
        .strip_prefix("0x")
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| ProfileError::InvalidField {
            line: line_no,
            field: "address",
            value: fields[1].to_string(),
        })?;
    let heat: u64 = number(line_no, "heat", fields[2])?;
    let opt_mode: u8 = number(line_no, "opt_mode", fields[3])?;
    let branch_offset: u32 = number(line_no, "branch_offset", fields[4])?;
    let inline_offset: u32 = number(line_no, "inline_offset", fields[5])?;

    DecisionRecord::from_parts(
        name,
        addr,
        heat,
        opt_mode,
        branch_offset,
        inline_offset,
        fields[6],
    )
    .ok_or(ProfileError::InconsistentMode {
        line: line_no,
        opt_mode,
    })
}

/// Whether `record` can be written as a single line that parses back to it.
/// The routine name ends at the first comma and no field may break the line.
pub fn is_storable(record: &DecisionRecord) -> bool {
    let breaks_line = |s: &str| s.contains(['\n', '\r']);
    !record.name().is_empty()
        && !record.name().contains(',')
        && !breaks_line(record.name())
        && !breaks_line(record.inline_callee())
}

/// Write all records, one per line, and return how many were written.
/// Records that cannot be stored are logged and skipped.
pub fn write_profile<W: Write>(out: &mut W, records: &[DecisionRecord]) -> io::Result<usize> {
    let mut written = 0;
    for record in records {
        if !is_storable(record) {
            log::warn!(
                "not writing profile record for {:?}: name cannot be stored",
                record.name()
            );
            continue;
        }
        writeln!(out, "{}", format_record(record))?;
        written += 1;
    }
    Ok(written)
}

/// Write the profile file at `path`, replacing any previous content.
pub fn save_profile(path: &Path, records: &[DecisionRecord]) -> Result<(), RunError> {
    let io_err = |source| RunError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::File::create(path).map_err(io_err)?;
    let mut out = BufWriter::new(file);
    let written = write_profile(&mut out, records).map_err(io_err)?;
    out.flush().map_err(io_err)?;
    log::info!("wrote {written} records to {}", path.display());
    Ok(())
}

/// Decision records read from a profile, by routine name.
#[derive(Debug, Default, Clone)]
pub struct ProfileTable {
    records: HashMap<String, DecisionRecord>,
    /// Routine names in file order.
    order: Vec<String>,
    rejected: usize,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. A later record for the same routine replaces the earlier
    /// one.
    pub fn insert(&mut self, record: DecisionRecord) {
        let name = record.name().to_string();
        if self.records.insert(name.clone(), record).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&DecisionRecord> {
        self.records.get(name)
    }

    /// The decision for a routine, or the all-zero decision if the profile
    /// has none.
    pub fn decision_for(&self, name: &str, addr: u64) -> DecisionRecord {
        self.records
            .get(name)
            .cloned()
            .unwrap_or_else(|| DecisionRecord::none(name, addr, 0))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of lines that were dropped as malformed.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Records in file order.
    pub fn iter(&self) -> impl Iterator<Item = &DecisionRecord> + '_ {
        self.order.iter().filter_map(|name| self.records.get(name))
    }
}

/// Parse a whole profile. Malformed lines are logged and dropped.
pub fn parse_profile<R: BufRead>(input: R) -> io::Result<ProfileTable> {
    let mut table = ProfileTable::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(line, idx + 1) {
            Ok(record) => table.insert(record),
            Err(e) => {
                log::warn!("dropping profile record: {e}");
                table.rejected += 1;
            }
        }
    }
    Ok(table)
}

/// Load the profile file at `path`.
///
/// A missing file aborts the run: nothing can be rewritten without the
/// statistics of a prior profiling pass.
pub fn load_profile(path: &Path) -> Result<ProfileTable, RunError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(RunError::MissingProfile {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(RunError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let table = parse_profile(BufReader::new(file)).map_err(|source| RunError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!(
        "loaded {} records from {} ({} rejected)",
        table.len(),
        path.display(),
        table.rejected()
    );
    Ok(table)
}
