//! Stuck-PG classification.
//!
//! A PG is stuck when it matches one of the requested unhealthy conditions
//! and its state has not changed since a cutoff. Read-only over the PG
//! records; never mutates the map.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use crate::model::{ParseStateError, PgId, PgRecord, PgState, Timestamp};

/// Set of unhealthy conditions a stuck query asks about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct StuckConditions(u8);

impl StuckConditions {
    /// State lacks `active`.
    pub const INACTIVE: StuckConditions = StuckConditions(1 << 0);
    /// State lacks `clean`.
    pub const UNCLEAN: StuckConditions = StuckConditions(1 << 1);
    pub const UNDERSIZED: StuckConditions = StuckConditions(1 << 2);
    pub const DEGRADED: StuckConditions = StuckConditions(1 << 3);
    pub const STALE: StuckConditions = StuckConditions(1 << 4);

    const NAMES: [(StuckConditions, &'static str); 5] = [
        (StuckConditions::INACTIVE, "inactive"),
        (StuckConditions::UNCLEAN, "unclean"),
        (StuckConditions::UNDERSIZED, "undersized"),
        (StuckConditions::DEGRADED, "degraded"),
        (StuckConditions::STALE, "stale"),
    ];

    pub const fn empty() -> Self {
        StuckConditions(0)
    }

    pub const fn all() -> Self {
        StuckConditions(0b1_1111)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: StuckConditions) -> bool {
        self.0 & other.0 != 0
    }

    /// Conditions a PG in `state` currently exhibits.
    pub fn of_state(state: PgState) -> Self {
        let mut c = StuckConditions::empty();
        if !state.contains(PgState::ACTIVE) {
            c = c | StuckConditions::INACTIVE;
        }
        if !state.contains(PgState::CLEAN) {
            c = c | StuckConditions::UNCLEAN;
        }
        if state.contains(PgState::UNDERSIZED) {
            c = c | StuckConditions::UNDERSIZED;
        }
        if state.contains(PgState::DEGRADED) {
            c = c | StuckConditions::DEGRADED;
        }
        if state.contains(PgState::STALE) {
            c = c | StuckConditions::STALE;
        }
        c
    }
}

impl BitOr for StuckConditions {
    type Output = StuckConditions;

    fn bitor(self, rhs: StuckConditions) -> StuckConditions {
        StuckConditions(self.0 | rhs.0)
    }
}

impl fmt::Display for StuckConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(c, _)| self.intersects(*c))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(","))
    }
}

impl FromStr for StuckConditions {
    type Err = ParseStateError;

    /// Parses a comma-separated list such as `inactive,stale`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut c = StuckConditions::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let bit = Self::NAMES
                .iter()
                .find(|(_, name)| *name == part)
                .map(|(bit, _)| *bit)
                .ok_or_else(|| ParseStateError(format!("unknown stuck condition '{}'", part)))?;
            c = c | bit;
        }
        Ok(c)
    }
}

/// True if `rec` matches any of `conditions` and has not changed state
/// after `cutoff`.
pub fn is_stuck(rec: &PgRecord, conditions: StuckConditions, cutoff: Timestamp) -> bool {
    rec.last_change <= cutoff && StuckConditions::of_state(rec.state).intersects(conditions)
}

/// Filters `pgs` down to the stuck ones, preserving iteration order.
pub fn stuck_pgs<'a>(
    pgs: impl IntoIterator<Item = (&'a PgId, &'a PgRecord)>,
    conditions: StuckConditions,
    cutoff: Timestamp,
) -> Vec<(PgId, &'a PgRecord)> {
    pgs.into_iter()
        .filter(|(_, rec)| is_stuck(rec, conditions, cutoff))
        .map(|(id, rec)| (*id, rec))
        .collect()
}
