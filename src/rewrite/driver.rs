// This module drives a rewriting pass over an image. The Rewriter is built from an instruction
// query service, the decision records loaded from a previous profiling pass and the run
// configuration. It selects the hottest routines of the image that have a record (heat
// descending, name ascending on equal heat, at most the configured limit), rebuilds each one
// with the instruction map builder and, when a code-cache base is configured, links them one
// after another at 16-byte aligned addresses from that base. Every failure is local to its
// routine: the routine is recorded as unmodified in the session and the pass moves on.

//! The rewriting pass.

use crate::core::config::Config;
use crate::core::error::{RewriteError, RewriteResult, RunError};
use crate::core::query::{InstructionQuery, RoutineInfo};
use crate::core::session::{RewriteSession, TranslatedRoutine, Translation};
use crate::profile::decision::DecisionRecord;
use crate::profile::format::{load_profile, ProfileTable};
use crate::rewrite::builder::build_instr_map;
use crate::rewrite::map::InstrMap;
use crate::x64::link::{link, LinkedCode};

/// Alignment of routines placed in the code cache.
pub const ROUTINE_ALIGN: u64 = 16;

/// Rewrites the hot routines of one image.
pub struct Rewriter<'a> {
    query: &'a dyn InstructionQuery,
    profile: ProfileTable,
    config: Config,
}

impl<'a> Rewriter<'a> {
    pub fn new(query: &'a dyn InstructionQuery, profile: ProfileTable, config: Config) -> Self {
        Self {
            query,
            profile,
            config,
        }
    }

    /// Load the profile named by `config`. Fails if there is none.
    pub fn from_config(query: &'a dyn InstructionQuery, config: Config) -> Result<Self, RunError> {
        let profile = load_profile(config.profile())?;
        Ok(Self::new(query, profile, config))
    }

    pub fn profile(&self) -> &ProfileTable {
        &self.profile
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The decision for `routine`, all zero if the profile has none.
    pub fn decision_for(&self, routine: &RoutineInfo) -> DecisionRecord {
        self.profile.decision_for(&routine.name, routine.addr)
    }

    /// The routines to rewrite, hottest first.
    pub fn hot_routines(&self) -> Vec<(RoutineInfo, DecisionRecord)> {
        let mut hot: Vec<_> = self
            .profile
            .iter()
            .filter_map(|record| match self.query.routine_by_name(record.name()) {
                Some(routine) => {
                    if routine.addr != record.addr() {
                        log::trace!(
                            "{} moved from {:#x} to {:#x}",
                            routine.name,
                            record.addr(),
                            routine.addr
                        );
                    }
                    Some((routine, record.clone()))
                }
                None => {
                    log::debug!("{} is not in the image", record.name());
                    None
                }
            })
            .collect();
        hot.sort_by(|(_, a), (_, b)| {
            b.heat()
                .cmp(&a.heat())
                .then_with(|| a.name().cmp(b.name()))
        });
        hot.truncate(self.config.hot_routines());
        hot
    }

    /// Rebuild one routine, optionally linking it at `place`.
    pub fn rewrite_routine(
        &self,
        routine: &RoutineInfo,
        decision: &DecisionRecord,
        place: Option<u64>,
    ) -> RewriteResult<(InstrMap, Option<LinkedCode>)> {
        let map = build_instr_map(self.query, routine, decision, &self.config)?;
        let linked = match place {
            Some(base) => Some(link(&map, base)?),
            None => None,
        };
        Ok((map, linked))
    }

    /// Rewrite the hot routines and return the session.
    pub fn run(&self) -> RewriteSession {
        let mut session = RewriteSession::new();
        let hot = self.hot_routines();
        log::info!(
            "rewriting {} of {} profiled routines",
            hot.len(),
            self.profile.len()
        );

        let mut cursor = self.config.cache_base();
        for (routine, decision) in hot {
            let result = match cursor {
                Some(c) => c
                    .checked_next_multiple_of(ROUTINE_ALIGN)
                    .ok_or(RewriteError::AddressOverflow { base: c })
                    .map(Some),
                None => Ok(None),
            }
            .and_then(|place| self.rewrite_routine(&routine, &decision, place));
            let translation = match result {
                Ok((map, linked)) => {
                    if let Some(code) = &linked {
                        cursor = Some(code.base() + code.len() as u64);
                    }
                    Translation::Rewritten { map, linked }
                }
                Err(reason) => Translation::Unmodified { reason },
            };
            session.record(TranslatedRoutine {
                name: routine.name.clone(),
                addr: routine.addr,
                size: routine.size,
                decision,
                translation,
            });
        }
        log::info!(
            "rewrote {} routines, {} left unmodified",
            session.stats().routines_rewritten,
            session.stats().routines_unmodified
        );
        session
    }
}
