//! The aggregate: PG records, node records, per-node epochs, full/nearfull
//! classification and the running sums over all of them.
//!
//! Mutation happens through point mutators (see `mutate`) or, for committed
//! batches, through [`PgMap::apply_incremental`]. Everything else is a
//! read-only query. A `PgMap` is an ordinary owned value; concurrent access
//! goes through [`crate::SharedPgMap`].

mod apply;
mod filter;
mod full;
mod mutate;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::{MapConfig, normalize_ratio};
use crate::delta::{DeltaTracker, IoRate};
use crate::error::PgMapError;
use crate::model::{
    Epoch, GlobalStatSum, NodeId, NodeRecord, NodeStatSum, PgId, PgRecord, PgState, PoolId,
    PoolStatSum, RecoverySummary, Timestamp, Version,
};
use crate::stuck::{self, StuckConditions};

pub use apply::{ApplyOutcome, StaleReport};
pub use filter::PgFilter;
pub use full::{Fullness, FullnessChange};

/// Lazily computed epoch with an explicit dirty flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CachedEpoch {
    value: Epoch,
    dirty: bool,
}

impl CachedEpoch {
    fn stale() -> Self {
        Self {
            value: 0,
            dirty: true,
        }
    }

    fn fresh(value: Epoch) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    fn invalidate(&mut self) {
        self.dirty = true;
    }

    fn get(&self) -> Option<Epoch> {
        (!self.dirty).then_some(self.value)
    }
}

/// In-memory aggregate of PG and storage-node state.
#[derive(Clone, Debug)]
pub struct PgMap {
    version: Version,
    /// Epoch of the last applied cluster-membership update.
    last_epoch: Epoch,
    /// Epoch at which PG creation was last scanned for.
    last_pg_scan: Epoch,
    stamp: Timestamp,
    full_ratio: f64,
    nearfull_ratio: f64,
    delta_window: usize,

    pg_stat: BTreeMap<PgId, PgRecord>,
    node_stat: BTreeMap<NodeId, NodeRecord>,
    /// Always has exactly the keys of `node_stat`.
    node_epochs: BTreeMap<NodeId, Epoch>,
    full_nodes: BTreeSet<NodeId>,
    nearfull_nodes: BTreeSet<NodeId>,

    pool_sums: BTreeMap<PoolId, PoolStatSum>,
    sum: GlobalStatSum,
    /// Node -> PGs whose up or acting set contains it.
    pgs_by_node: BTreeMap<NodeId, BTreeSet<PgId>>,
    primary_pgs_by_node: BTreeMap<NodeId, i64>,
    /// Node -> number of PGs whose peering is blocked on it.
    blocked_by_sum: BTreeMap<NodeId, i64>,
    creating_pgs: BTreeSet<PgId>,
    /// Acting primary -> creating PGs it leads.
    creating_pgs_by_node: BTreeMap<NodeId, BTreeSet<PgId>>,

    pool_deltas: BTreeMap<PoolId, DeltaTracker>,
    global_delta: DeltaTracker,

    min_last_epoch_clean: CachedEpoch,
}

impl Default for PgMap {
    fn default() -> Self {
        Self::new(&MapConfig::default())
    }
}

/// Complete point-in-time value of a [`PgMap`], for persistence.
///
/// Derived indexes (node -> PG sets, primary, blocked-by and creating
/// counts) and the min-last-epoch-clean cache are not stored; they are
/// rebuilt on import.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PgMapSnapshot {
    pub version: Version,
    pub last_epoch: Epoch,
    pub last_pg_scan: Epoch,
    pub stamp: Timestamp,
    pub full_ratio: f64,
    pub nearfull_ratio: f64,
    pub delta_window: usize,
    pub pg_stat: BTreeMap<PgId, PgRecord>,
    pub node_stat: BTreeMap<NodeId, NodeRecord>,
    pub node_epochs: BTreeMap<NodeId, Epoch>,
    pub full_nodes: BTreeSet<NodeId>,
    pub nearfull_nodes: BTreeSet<NodeId>,
    pub pool_sums: BTreeMap<PoolId, PoolStatSum>,
    pub sum: GlobalStatSum,
    pub pool_deltas: BTreeMap<PoolId, DeltaTracker>,
    pub global_delta: DeltaTracker,
}

impl PgMap {
    /// Creates an empty map at version 0.
    pub fn new(config: &MapConfig) -> Self {
        let delta_window = config.delta_window.max(1);
        Self {
            version: 0,
            last_epoch: 0,
            last_pg_scan: 0,
            stamp: 0,
            full_ratio: normalize_ratio(config.full_ratio),
            nearfull_ratio: normalize_ratio(config.nearfull_ratio),
            delta_window,
            pg_stat: BTreeMap::new(),
            node_stat: BTreeMap::new(),
            node_epochs: BTreeMap::new(),
            full_nodes: BTreeSet::new(),
            nearfull_nodes: BTreeSet::new(),
            pool_sums: BTreeMap::new(),
            sum: GlobalStatSum::default(),
            pgs_by_node: BTreeMap::new(),
            primary_pgs_by_node: BTreeMap::new(),
            blocked_by_sum: BTreeMap::new(),
            creating_pgs: BTreeSet::new(),
            creating_pgs_by_node: BTreeMap::new(),
            pool_deltas: BTreeMap::new(),
            global_delta: DeltaTracker::new(delta_window),
            min_last_epoch_clean: CachedEpoch::fresh(0),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Epoch of the last applied cluster-membership update.
    pub fn last_epoch(&self) -> Epoch {
        self.last_epoch
    }

    pub fn last_pg_scan(&self) -> Epoch {
        self.last_pg_scan
    }

    /// Stamp of the last applied incremental.
    pub fn stamp(&self) -> Timestamp {
        self.stamp
    }

    pub fn full_ratio(&self) -> f64 {
        self.full_ratio
    }

    pub fn nearfull_ratio(&self) -> f64 {
        self.nearfull_ratio
    }

    pub fn delta_window(&self) -> usize {
        self.delta_window
    }

    // ---------------------------------------------------------------------
    // PG and node lookups
    // ---------------------------------------------------------------------

    pub fn pg(&self, id: PgId) -> Option<&PgRecord> {
        self.pg_stat.get(&id)
    }

    pub fn pgs(&self) -> &BTreeMap<PgId, PgRecord> {
        &self.pg_stat
    }

    /// PGs of one pool, in seed order.
    pub fn pool_pgs(&self, pool: PoolId) -> impl Iterator<Item = (&PgId, &PgRecord)> {
        self.pg_stat
            .range(PgId::new(pool, 0)..=PgId::new(pool, u32::MAX))
    }

    pub fn num_pgs(&self) -> usize {
        self.pg_stat.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.node_stat.get(&id)
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, NodeRecord> {
        &self.node_stat
    }

    /// Epoch of the latest accepted report from `id`.
    pub fn node_epoch(&self, id: NodeId) -> Option<Epoch> {
        self.node_epochs.get(&id).copied()
    }

    pub fn node_epochs(&self) -> &BTreeMap<NodeId, Epoch> {
        &self.node_epochs
    }

    pub fn num_nodes(&self) -> usize {
        self.node_stat.len()
    }

    /// PGs whose up or acting set includes `id`.
    pub fn pgs_on_node(&self, id: NodeId) -> Option<&BTreeSet<PgId>> {
        self.pgs_by_node.get(&id)
    }

    /// Number of PGs for which `id` is the acting primary.
    pub fn num_primary_pgs(&self, id: NodeId) -> i64 {
        self.primary_pgs_by_node.get(&id).copied().unwrap_or(0)
    }

    /// Per-node count of PGs blocked on that node. Nodes blocking nothing
    /// are absent.
    pub fn blocked_by_sum(&self) -> &BTreeMap<NodeId, i64> {
        &self.blocked_by_sum
    }

    /// PGs in the creating state.
    pub fn creating_pgs(&self) -> &BTreeSet<PgId> {
        &self.creating_pgs
    }

    /// Creating PGs whose acting primary is `id`.
    pub fn creating_pgs_on_node(&self, id: NodeId) -> Option<&BTreeSet<PgId>> {
        self.creating_pgs_by_node.get(&id)
    }

    // ---------------------------------------------------------------------
    // Sums
    // ---------------------------------------------------------------------

    /// Sum over one pool's PGs; `None` for a pool the map does not know.
    pub fn pool_sum(&self, pool: PoolId) -> Option<&PoolStatSum> {
        self.pool_sums.get(&pool)
    }

    pub fn pool_sums(&self) -> &BTreeMap<PoolId, PoolStatSum> {
        &self.pool_sums
    }

    pub fn global_sum(&self) -> &GlobalStatSum {
        &self.sum
    }

    pub fn node_sum(&self) -> &NodeStatSum {
        &self.sum.nodes
    }

    /// Cluster-wide PG count per state.
    pub fn pg_state_summary(&self) -> &BTreeMap<PgState, i64> {
        &self.sum.pg.num_pg_by_state
    }

    /// Cluster-wide degraded, misplaced and unfound objects.
    pub fn recovery_summary(&self) -> RecoverySummary {
        RecoverySummary::from_stats(&self.sum.pg.stats)
    }

    /// Recovery summary of one pool; `None` for an unknown pool.
    pub fn pool_recovery_summary(&self, pool: PoolId) -> Option<RecoverySummary> {
        self.pool_sums
            .get(&pool)
            .map(|s| RecoverySummary::from_stats(&s.stats))
    }

    // ---------------------------------------------------------------------
    // Full / nearfull
    // ---------------------------------------------------------------------

    pub fn full_nodes(&self) -> &BTreeSet<NodeId> {
        &self.full_nodes
    }

    pub fn nearfull_nodes(&self) -> &BTreeSet<NodeId> {
        &self.nearfull_nodes
    }

    pub fn fullness(&self, id: NodeId) -> Fullness {
        if self.full_nodes.contains(&id) {
            Fullness::Full
        } else if self.nearfull_nodes.contains(&id) {
            Fullness::Nearfull
        } else {
            Fullness::Normal
        }
    }

    // ---------------------------------------------------------------------
    // Stuck PGs
    // ---------------------------------------------------------------------

    /// PGs matching any of `conditions` whose state last changed at or
    /// before `cutoff`.
    pub fn stuck_pgs(
        &self,
        conditions: StuckConditions,
        cutoff: Timestamp,
    ) -> Vec<(PgId, &PgRecord)> {
        stuck::stuck_pgs(&self.pg_stat, conditions, cutoff)
    }

    /// [`Self::stuck_pgs`] with `cutoff = now - threshold_ms`.
    pub fn stuck_pgs_older_than(
        &self,
        conditions: StuckConditions,
        now: Timestamp,
        threshold_ms: i64,
    ) -> Vec<(PgId, &PgRecord)> {
        self.stuck_pgs(conditions, now.saturating_sub(threshold_ms))
    }

    // ---------------------------------------------------------------------
    // Rates
    // ---------------------------------------------------------------------

    /// Delta history of one pool.
    pub fn pool_delta(&self, pool: PoolId) -> Option<&DeltaTracker> {
        self.pool_deltas.get(&pool)
    }

    pub fn global_delta(&self) -> &DeltaTracker {
        &self.global_delta
    }

    /// Client I/O and recovery rate of one pool over the last `window`
    /// samples (all retained samples if `None`).
    ///
    /// `None` for an unknown pool; a known pool without history yet has a
    /// zero rate.
    pub fn pool_io_rate(&self, pool: PoolId, window: Option<usize>) -> Option<IoRate> {
        if !self.pool_sums.contains_key(&pool) {
            return None;
        }
        Some(
            self.pool_deltas
                .get(&pool)
                .map(|t| rate_of(t, window))
                .unwrap_or_default(),
        )
    }

    /// Cluster-wide client I/O and recovery rate.
    pub fn global_io_rate(&self, window: Option<usize>) -> IoRate {
        rate_of(&self.global_delta, window)
    }

    // ---------------------------------------------------------------------
    // min_last_epoch_clean
    // ---------------------------------------------------------------------

    /// Minimum `last_epoch_clean` over PGs that are not creating, 0 if none.
    ///
    /// Served from the cache when clean; recomputed and cached otherwise.
    pub fn min_last_epoch_clean(&mut self) -> Epoch {
        if let Some(value) = self.min_last_epoch_clean.get() {
            return value;
        }
        let value = self.compute_min_last_epoch_clean();
        self.min_last_epoch_clean = CachedEpoch::fresh(value);
        value
    }

    /// Cached value, or `None` if a PG change invalidated it.
    pub fn cached_min_last_epoch_clean(&self) -> Option<Epoch> {
        self.min_last_epoch_clean.get()
    }

    /// Full scan, bypassing the cache.
    pub fn compute_min_last_epoch_clean(&self) -> Epoch {
        self.pg_stat
            .values()
            .filter(|rec| !rec.state.contains(PgState::CREATING))
            .map(|rec| rec.last_epoch_clean)
            .min()
            .unwrap_or(0)
    }

    // ---------------------------------------------------------------------
    // Consistency
    // ---------------------------------------------------------------------

    /// Recomputes every sum from the records and compares with the running
    /// sums. A pool absent from one side matches a zero sum on the other.
    pub fn sums_consistent(&self) -> bool {
        let mut pools: BTreeMap<PoolId, PoolStatSum> = BTreeMap::new();
        let mut pg = PoolStatSum::default();
        for (id, rec) in &self.pg_stat {
            pools.entry(id.pool).or_default().add_pg(rec);
            pg.add_pg(rec);
        }
        let mut nodes = NodeStatSum::default();
        for rec in self.node_stat.values() {
            nodes.add_node(rec);
        }

        let pools_match = self
            .pool_sums
            .iter()
            .all(|(pool, s)| pools.get(pool).map_or(s.is_zero(), |p| p == s))
            && pools.keys().all(|pool| self.pool_sums.contains_key(pool));

        pools_match && pg == self.sum.pg && nodes == self.sum.nodes
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Exports the complete state.
    pub fn to_snapshot(&self) -> PgMapSnapshot {
        PgMapSnapshot {
            version: self.version,
            last_epoch: self.last_epoch,
            last_pg_scan: self.last_pg_scan,
            stamp: self.stamp,
            full_ratio: self.full_ratio,
            nearfull_ratio: self.nearfull_ratio,
            delta_window: self.delta_window,
            pg_stat: self.pg_stat.clone(),
            node_stat: self.node_stat.clone(),
            node_epochs: self.node_epochs.clone(),
            full_nodes: self.full_nodes.clone(),
            nearfull_nodes: self.nearfull_nodes.clone(),
            pool_sums: self.pool_sums.clone(),
            sum: self.sum.clone(),
            pool_deltas: self.pool_deltas.clone(),
            global_delta: self.global_delta.clone(),
        }
    }

    /// Builds a map from a snapshot after checking it.
    ///
    /// Rejects snapshots whose node-epoch and node-record key sets differ,
    /// whose records could not have been upserted, whose full/nearfull sets
    /// name unknown nodes, whose delta trackers name unknown pools or
    /// disagree with their own samples, or whose stored sums disagree with
    /// the records.
    pub fn from_snapshot(snap: PgMapSnapshot) -> Result<Self, PgMapError> {
        if !snap.node_epochs.keys().eq(snap.node_stat.keys()) {
            return Err(PgMapError::InvalidSnapshot(format!(
                "node epoch map ({} entries) and node records ({} entries) disagree",
                snap.node_epochs.len(),
                snap.node_stat.len()
            )));
        }
        if let Some((id, field)) = snap
            .pg_stat
            .iter()
            .find_map(|(id, rec)| rec.first_invalid().map(|f| (id, f)))
        {
            return Err(PgMapError::InvalidSnapshot(format!(
                "pg {} has invalid {}",
                id, field
            )));
        }
        if let Some((id, field)) = snap
            .node_stat
            .iter()
            .find_map(|(id, rec)| rec.first_invalid().map(|f| (id, f)))
        {
            return Err(PgMapError::InvalidSnapshot(format!(
                "node {} has invalid {}",
                id, field
            )));
        }
        if let Some(id) = snap
            .full_nodes
            .iter()
            .chain(&snap.nearfull_nodes)
            .find(|id| !snap.node_stat.contains_key(*id))
        {
            return Err(PgMapError::InvalidSnapshot(format!(
                "full/nearfull set names unknown node {}",
                id
            )));
        }
        if let Some(pool) = snap
            .pool_deltas
            .keys()
            .find(|pool| !snap.pool_sums.contains_key(*pool))
        {
            return Err(PgMapError::InvalidSnapshot(format!(
                "delta history for unknown pool {}",
                pool
            )));
        }
        let delta_window = snap.delta_window.max(1);
        let trackers = snap
            .pool_deltas
            .iter()
            .map(|(pool, t)| (format!("pool {}", pool), t))
            .chain(std::iter::once(("global".to_string(), &snap.global_delta)));
        for (name, tracker) in trackers {
            if tracker.capacity() != delta_window {
                return Err(PgMapError::InvalidSnapshot(format!(
                    "{} delta history has capacity {}, window is {}",
                    name,
                    tracker.capacity(),
                    delta_window
                )));
            }
            if let Some(what) = tracker.first_inconsistency() {
                return Err(PgMapError::InvalidSnapshot(format!(
                    "{} delta history: {}",
                    name, what
                )));
            }
        }

        let stored_pools = snap.pool_sums.clone();
        let stored_sum = snap.sum.clone();
        let mut map = Self {
            version: snap.version,
            last_epoch: snap.last_epoch,
            last_pg_scan: snap.last_pg_scan,
            stamp: snap.stamp,
            full_ratio: snap.full_ratio,
            nearfull_ratio: snap.nearfull_ratio,
            delta_window,
            pg_stat: snap.pg_stat,
            node_stat: snap.node_stat,
            node_epochs: snap.node_epochs,
            full_nodes: snap.full_nodes,
            nearfull_nodes: snap.nearfull_nodes,
            pool_sums: snap.pool_sums,
            sum: snap.sum,
            pgs_by_node: BTreeMap::new(),
            primary_pgs_by_node: BTreeMap::new(),
            blocked_by_sum: BTreeMap::new(),
            creating_pgs: BTreeSet::new(),
            creating_pgs_by_node: BTreeMap::new(),
            pool_deltas: snap.pool_deltas,
            global_delta: snap.global_delta,
            min_last_epoch_clean: CachedEpoch::stale(),
        };
        map.recompute_aggregates();

        if map.pool_sums != stored_pools || map.sum != stored_sum {
            return Err(PgMapError::InvalidSnapshot(
                "stored sums disagree with records".to_string(),
            ));
        }
        Ok(map)
    }
}

fn rate_of(tracker: &DeltaTracker, window: Option<usize>) -> IoRate {
    match window {
        Some(n) => tracker.rate_over(n),
        None => tracker.rate(),
    }
}
