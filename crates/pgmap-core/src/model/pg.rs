//! Placement-group identifiers, state bits and per-PG stat records.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::sum::ObjectStatSum;
use super::{Epoch, NodeId, PoolId, Timestamp};

/// Placement-group identifier: owning pool plus placement seed.
///
/// Displayed as `{pool}.{seed:x}`, e.g. `3.1a`.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PgId {
    pub pool: PoolId,
    pub seed: u32,
}

impl PgId {
    pub const fn new(pool: PoolId, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

impl FromStr for PgId {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pool, seed) = s
            .split_once('.')
            .ok_or_else(|| ParseStateError(format!("invalid pg id '{}'", s)))?;
        let pool = pool
            .parse::<PoolId>()
            .map_err(|e| ParseStateError(format!("invalid pool in '{}': {}", s, e)))?;
        let seed = u32::from_str_radix(seed, 16)
            .map_err(|e| ParseStateError(format!("invalid seed in '{}': {}", s, e)))?;
        Ok(Self { pool, seed })
    }
}

/// Error for unparseable state names, condition names and PG ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStateError(pub String);

impl fmt::Display for ParseStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseStateError {}

/// PG state bit set. Bits are non-exclusive (`active+clean+scrubbing`).
#[derive(
    Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct PgState(u32);

impl PgState {
    pub const CREATING: PgState = PgState(1 << 0);
    pub const ACTIVE: PgState = PgState(1 << 1);
    pub const CLEAN: PgState = PgState(1 << 2);
    pub const DOWN: PgState = PgState(1 << 3);
    pub const SCRUBBING: PgState = PgState(1 << 4);
    pub const DEGRADED: PgState = PgState(1 << 5);
    pub const INCONSISTENT: PgState = PgState(1 << 6);
    pub const PEERING: PgState = PgState(1 << 7);
    pub const REPAIR: PgState = PgState(1 << 8);
    pub const RECOVERING: PgState = PgState(1 << 9);
    pub const BACKFILL_WAIT: PgState = PgState(1 << 10);
    pub const INCOMPLETE: PgState = PgState(1 << 11);
    pub const STALE: PgState = PgState(1 << 12);
    pub const REMAPPED: PgState = PgState(1 << 13);
    pub const DEEP: PgState = PgState(1 << 14);
    pub const BACKFILLING: PgState = PgState(1 << 15);
    pub const BACKFILL_TOOFULL: PgState = PgState(1 << 16);
    pub const RECOVERY_WAIT: PgState = PgState(1 << 17);
    pub const UNDERSIZED: PgState = PgState(1 << 18);
    pub const ACTIVATING: PgState = PgState(1 << 19);
    pub const PEERED: PgState = PgState(1 << 20);

    /// Display order of state names.
    const NAMES: [(PgState, &'static str); 21] = [
        (PgState::CREATING, "creating"),
        (PgState::ACTIVE, "active"),
        (PgState::CLEAN, "clean"),
        (PgState::RECOVERY_WAIT, "recovery_wait"),
        (PgState::RECOVERING, "recovering"),
        (PgState::DOWN, "down"),
        (PgState::UNDERSIZED, "undersized"),
        (PgState::DEGRADED, "degraded"),
        (PgState::REMAPPED, "remapped"),
        (PgState::SCRUBBING, "scrubbing"),
        (PgState::DEEP, "deep"),
        (PgState::INCONSISTENT, "inconsistent"),
        (PgState::PEERING, "peering"),
        (PgState::REPAIR, "repair"),
        (PgState::BACKFILL_WAIT, "backfill_wait"),
        (PgState::BACKFILLING, "backfilling"),
        (PgState::BACKFILL_TOOFULL, "backfill_toofull"),
        (PgState::INCOMPLETE, "incomplete"),
        (PgState::STALE, "stale"),
        (PgState::PEERED, "peered"),
        (PgState::ACTIVATING, "activating"),
    ];

    pub const fn empty() -> Self {
        PgState(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        PgState(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: PgState) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set.
    pub const fn intersects(self, other: PgState) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: PgState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PgState) {
        self.0 &= !other.0;
    }
}

impl BitOr for PgState {
    type Output = PgState;

    fn bitor(self, rhs: PgState) -> PgState {
        PgState(self.0 | rhs.0)
    }
}

impl BitOrAssign for PgState {
    fn bitor_assign(&mut self, rhs: PgState) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for PgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("unknown");
        }
        let mut first = true;
        for (bit, name) in Self::NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for PgState {
    type Err = ParseStateError;

    /// Parses `active+clean` style strings; `unknown` is the empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "unknown" {
            return Ok(PgState::empty());
        }
        let mut state = PgState::empty();
        for part in s.split('+') {
            let bit = Self::NAMES
                .iter()
                .find(|(_, name)| *name == part)
                .map(|(bit, _)| *bit)
                .ok_or_else(|| ParseStateError(format!("unknown pg state '{}'", part)))?;
            state.insert(bit);
        }
        Ok(state)
    }
}

/// Stat snapshot reported for one placement group.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct PgRecord {
    /// Current state bits.
    pub state: PgState,

    /// Nodes the PG maps to under the current placement.
    pub up: Vec<NodeId>,

    /// Nodes currently serving the PG; the first entry is the primary.
    pub acting: Vec<NodeId>,

    /// Object, byte and I/O counters.
    pub stats: ObjectStatSum,

    /// Last epoch at which the PG was clean.
    pub last_epoch_clean: Epoch,

    /// When `state` last changed.
    pub last_change: Timestamp,

    /// Epoch of the report that produced this record.
    pub reported_epoch: Epoch,

    /// Per-PG report sequence number.
    pub reported_seq: u64,

    /// Nodes peering is waiting on.
    pub blocked_by: Vec<NodeId>,
}

impl PgRecord {
    /// Primary node, if the acting set is non-empty.
    pub fn acting_primary(&self) -> Option<NodeId> {
        self.acting.first().copied()
    }

    /// Union of up and acting sets, deduplicated.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.up.iter().chain(&self.acting).copied().collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Name of the first negative counter, if any.
    pub fn first_invalid(&self) -> Option<&'static str> {
        self.stats.first_negative()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(PgState::empty().to_string(), "unknown");
        assert_eq!((PgState::ACTIVE | PgState::CLEAN).to_string(), "active+clean");
        assert_eq!(
            (PgState::DEGRADED | PgState::ACTIVE | PgState::UNDERSIZED).to_string(),
            "active+undersized+degraded"
        );
    }

    #[test]
    fn test_state_parse() {
        let s: PgState = "active+clean+scrubbing+deep".parse().unwrap();
        assert!(s.contains(PgState::ACTIVE | PgState::CLEAN));
        assert!(s.contains(PgState::DEEP));
        assert!(!s.intersects(PgState::DEGRADED));
        assert_eq!("unknown".parse::<PgState>().unwrap(), PgState::empty());
        assert!("active+bogus".parse::<PgState>().is_err());
    }

    #[test]
    fn test_pgid_display_and_parse() {
        let id = PgId::new(3, 0x1a);
        assert_eq!(id.to_string(), "3.1a");
        assert_eq!("3.1a".parse::<PgId>().unwrap(), id);
        assert!("3".parse::<PgId>().is_err());
        assert!("x.1".parse::<PgId>().is_err());
    }

    #[test]
    fn test_pgid_ordering_groups_by_pool() {
        let mut ids = vec![PgId::new(2, 0), PgId::new(1, 5), PgId::new(1, 1)];
        ids.sort();
        assert_eq!(ids, vec![PgId::new(1, 1), PgId::new(1, 5), PgId::new(2, 0)]);
    }

    #[test]
    fn test_record_nodes_union() {
        let rec = PgRecord {
            up: vec![3, 1, 2],
            acting: vec![1, 4],
            ..PgRecord::default()
        };
        assert_eq!(rec.nodes(), vec![1, 2, 3, 4]);
        assert_eq!(rec.acting_primary(), Some(1));
        assert_eq!(PgRecord::default().acting_primary(), None);
    }

    #[test]
    fn test_record_first_invalid() {
        let mut rec = PgRecord::default();
        assert_eq!(rec.first_invalid(), None);
        rec.stats.num_objects_unfound = -1;
        assert_eq!(rec.first_invalid(), Some("num_objects_unfound"));
    }
}
