//! Tunables shared by the profiling and rewriting passes.

use crate::core::error::RunError;
use crate::profile::format::PROFILE_FILE_NAME;
use std::path::{Path, PathBuf};

/// Minimum taken/reached ratio for a branch to be worth reversing.
pub const DEFAULT_BIAS_THRESHOLD: f64 = 0.8;

/// Number of call instructions an inline-valid routine may contain.
pub const DEFAULT_MAX_CALLS: usize = 1;

/// Number of hottest routines the rewrite pass translates.
pub const DEFAULT_HOT_ROUTINE_LIMIT: usize = 10;

/// Configuration for a PGR run.
///
/// ```
/// use pgr::core::Config;
///
/// let mut config = Config::new();
/// config.hot_routine_limit(4).bias_threshold(0.9).unwrap();
/// assert_eq!(config.hot_routines(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    bias_threshold: f64,
    max_calls: usize,
    hot_routine_limit: usize,
    profile_path: PathBuf,
    code_cache_base: Option<u64>,
    dump: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bias_threshold: DEFAULT_BIAS_THRESHOLD,
            max_calls: DEFAULT_MAX_CALLS,
            hot_routine_limit: DEFAULT_HOT_ROUTINE_LIMIT,
            profile_path: PathBuf::from(PROFILE_FILE_NAME),
            code_cache_base: None,
            dump: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the taken/reached ratio a branch needs to be reordered. Must lie in
    /// `0.0..=1.0`.
    pub fn bias_threshold(&mut self, threshold: f64) -> Result<&mut Self, RunError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(RunError::InvalidConfig(format!(
                "bias threshold {threshold} is outside 0.0..=1.0"
            )));
        }
        self.bias_threshold = threshold;
        Ok(self)
    }

    pub fn max_calls(&mut self, max: usize) -> &mut Self {
        self.max_calls = max;
        self
    }

    pub fn hot_routine_limit(&mut self, limit: usize) -> &mut Self {
        self.hot_routine_limit = limit;
        self
    }

    pub fn profile_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.profile_path = path.into();
        self
    }

    /// Lay rewritten routines out at this code-cache address.
    pub fn code_cache_base(&mut self, base: Option<u64>) -> &mut Self {
        self.code_cache_base = base;
        self
    }

    pub fn dump(&mut self, dump: bool) -> &mut Self {
        self.dump = dump;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.bias_threshold
    }

    pub fn call_limit(&self) -> usize {
        self.max_calls
    }

    pub fn hot_routines(&self) -> usize {
        self.hot_routine_limit
    }

    pub fn profile(&self) -> &Path {
        &self.profile_path
    }

    pub fn cache_base(&self) -> Option<u64> {
        self.code_cache_base
    }

    pub fn dumps(&self) -> bool {
        self.dump
    }
}
