//! Point mutators and the full recompute.
//!
//! Each mutator keeps the sums exact: the old contribution of a replaced
//! record is subtracted before the new one is added. Any sum going negative
//! means the records and sums have diverged, which only happens if the
//! single-writer discipline was broken; that is fatal.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::apply::StaleReport;
use super::{CachedEpoch, FullnessChange, PgMap};
use crate::error::{PgMapError, RecordKey};
use crate::model::{
    Epoch, GlobalStatSum, NodeId, NodeRecord, PgId, PgRecord, PgState, PoolId, PoolStatSum,
};

impl PgMap {
    /// Inserts or replaces a PG record, adjusting pool and global sums.
    ///
    /// Fails with [`PgMapError::InvalidRecord`] and leaves the map untouched
    /// if the record carries a negative counter.
    pub fn upsert_pg(&mut self, id: PgId, record: PgRecord) -> Result<(), PgMapError> {
        if let Some(field) = record.first_invalid() {
            return Err(PgMapError::InvalidRecord {
                key: RecordKey::Pg(id),
                field,
            });
        }
        self.put_pg(id, record);
        Ok(())
    }

    /// [`Self::upsert_pg`] for records already validated by the builder.
    pub(super) fn put_pg(&mut self, id: PgId, record: PgRecord) {
        if let Some(old) = self.pg_stat.remove(&id) {
            self.stat_pg_sub(id, &old);
        }
        self.stat_pg_add(id, &record);
        self.pg_stat.insert(id, record);
        self.min_last_epoch_clean.invalidate();
    }

    /// Removes a PG record. Returns `false` if it was not present.
    pub fn remove_pg(&mut self, id: PgId) -> bool {
        let Some(old) = self.pg_stat.remove(&id) else {
            return false;
        };
        self.stat_pg_sub(id, &old);
        self.min_last_epoch_clean.invalidate();
        true
    }

    /// Removes a pool: all of its PGs, its sum and its delta history.
    /// Returns `false` if the pool was unknown.
    pub fn remove_pool(&mut self, pool: PoolId) -> bool {
        let ids: Vec<PgId> = self.pool_pgs(pool).map(|(id, _)| *id).collect();
        for id in &ids {
            self.remove_pg(*id);
        }
        self.pool_deltas.remove(&pool);
        match self.pool_sums.remove(&pool) {
            Some(left) => {
                if !left.is_zero() {
                    panic!(
                        "pool {} sum not zero after removing all of its PGs: {:?}",
                        pool, left
                    );
                }
                debug!(pool, pgs = ids.len(), "pgmap: pool removed");
                true
            }
            None => false,
        }
    }

    /// Inserts or replaces a node record reported under `epoch`.
    ///
    /// Fails with [`PgMapError::InvalidRecord`] if the record cannot be
    /// summed, or [`PgMapError::StaleEpoch`] if `epoch` is older than the
    /// epoch stored for the node; the map is untouched in both cases.
    /// Returns the node's full/nearfull transition, if any.
    pub fn upsert_node(
        &mut self,
        id: NodeId,
        epoch: Epoch,
        record: NodeRecord,
    ) -> Result<Option<FullnessChange>, PgMapError> {
        if let Some(field) = record.first_invalid() {
            return Err(PgMapError::InvalidRecord {
                key: RecordKey::Node(id),
                field,
            });
        }
        self.try_upsert_node(id, epoch, record)
            .map_err(|stale| PgMapError::StaleEpoch {
                node: stale.node,
                stored: stale.stored,
                reported: stale.reported,
            })
    }

    pub(super) fn try_upsert_node(
        &mut self,
        id: NodeId,
        epoch: Epoch,
        record: NodeRecord,
    ) -> Result<Option<FullnessChange>, StaleReport> {
        if let Some(&stored) = self.node_epochs.get(&id) {
            if epoch < stored {
                return Err(StaleReport {
                    node: id,
                    stored,
                    reported: epoch,
                });
            }
        }

        self.sum.nodes.add_node(&record);
        if let Some(old) = self.node_stat.insert(id, record) {
            self.sum.nodes.sub_node(&old);
        }
        self.node_epochs.insert(id, epoch);
        self.check_node_sum();
        self.assert_node_cardinality();

        Ok(self.register_nearfull_status(id))
    }

    /// Removes a node record, its epoch and its full/nearfull membership.
    /// Returns `false` if the node was not present.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let Some(old) = self.node_stat.remove(&id) else {
            return false;
        };
        self.node_epochs.remove(&id);
        self.full_nodes.remove(&id);
        self.nearfull_nodes.remove(&id);
        self.sum.nodes.sub_node(&old);
        self.check_node_sum();
        self.assert_node_cardinality();
        true
    }

    /// Rebuilds every sum, per-state count, the node -> PG index and
    /// min-last-epoch-clean from the records.
    ///
    /// Known pools keep their entry even if they have no PGs left.
    pub fn recompute_aggregates(&mut self) {
        for s in self.pool_sums.values_mut() {
            *s = PoolStatSum::default();
        }
        self.sum = GlobalStatSum::default();
        self.pgs_by_node.clear();
        self.primary_pgs_by_node.clear();
        self.blocked_by_sum.clear();
        self.creating_pgs.clear();
        self.creating_pgs_by_node.clear();

        let pg_stat = std::mem::take(&mut self.pg_stat);
        for (id, rec) in &pg_stat {
            self.stat_pg_add(*id, rec);
        }
        self.pg_stat = pg_stat;

        for rec in self.node_stat.values() {
            self.sum.nodes.add_node(rec);
        }
        self.assert_node_cardinality();

        self.min_last_epoch_clean = CachedEpoch::fresh(self.compute_min_last_epoch_clean());
        debug!(
            pgs = self.pg_stat.len(),
            nodes = self.node_stat.len(),
            pools = self.pool_sums.len(),
            "pgmap: aggregates recomputed"
        );
    }

    fn stat_pg_add(&mut self, id: PgId, rec: &PgRecord) {
        let pool_sum = self.pool_sums.entry(id.pool).or_default();
        pool_sum.add_pg(rec);
        if let Some(field) = pool_sum.first_negative() {
            panic!("pool {} sum went negative in {} adding pg {}", id.pool, field, id);
        }
        self.sum.pg.add_pg(rec);
        if let Some(field) = self.sum.pg.first_negative() {
            panic!("global pg sum went negative in {} adding pg {}", field, id);
        }

        for node in rec.nodes() {
            self.pgs_by_node.entry(node).or_default().insert(id);
        }
        if let Some(primary) = rec.acting_primary() {
            *self.primary_pgs_by_node.entry(primary).or_insert(0) += 1;
        }
        for &node in &rec.blocked_by {
            *self.blocked_by_sum.entry(node).or_insert(0) += 1;
        }
        if rec.state.contains(PgState::CREATING) {
            self.creating_pgs.insert(id);
            if let Some(primary) = rec.acting_primary() {
                self.creating_pgs_by_node.entry(primary).or_default().insert(id);
            }
        }
    }

    fn stat_pg_sub(&mut self, id: PgId, rec: &PgRecord) {
        let Some(pool_sum) = self.pool_sums.get_mut(&id.pool) else {
            panic!("pg {} present without a sum for pool {}", id, id.pool);
        };
        pool_sum.sub_pg(rec);
        if let Some(field) = pool_sum.first_negative() {
            panic!("pool {} sum went negative in {} removing pg {}", id.pool, field, id);
        }
        self.sum.pg.sub_pg(rec);
        if let Some(field) = self.sum.pg.first_negative() {
            panic!("global pg sum went negative in {} removing pg {}", field, id);
        }

        for node in rec.nodes() {
            remove_from_index(&mut self.pgs_by_node, node, id);
        }
        if let Some(primary) = rec.acting_primary() {
            decrement(&mut self.primary_pgs_by_node, primary);
        }
        for &node in &rec.blocked_by {
            decrement(&mut self.blocked_by_sum, node);
        }
        if rec.state.contains(PgState::CREATING) {
            self.creating_pgs.remove(&id);
            if let Some(primary) = rec.acting_primary() {
                remove_from_index(&mut self.creating_pgs_by_node, primary, id);
            }
        }
    }

    fn check_node_sum(&self) {
        if let Some(field) = self.sum.nodes.first_negative() {
            panic!("node sum went negative in {}", field);
        }
    }

    pub(super) fn assert_node_cardinality(&self) {
        if self.node_epochs.len() != self.node_stat.len() {
            panic!(
                "node epoch map has {} entries but {} node records exist",
                self.node_epochs.len(),
                self.node_stat.len()
            );
        }
    }
}

fn remove_from_index(index: &mut BTreeMap<NodeId, BTreeSet<PgId>>, node: NodeId, id: PgId) {
    if let Some(set) = index.get_mut(&node) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(&node);
        }
    }
}

fn decrement(counts: &mut BTreeMap<NodeId, i64>, node: NodeId) {
    if let Some(n) = counts.get_mut(&node) {
        *n -= 1;
        if *n == 0 {
            counts.remove(&node);
        }
    }
}
