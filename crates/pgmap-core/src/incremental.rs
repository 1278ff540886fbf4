//! Immutable batches of proposed changes to a [`PgMap`].
//!
//! A producer collects changes in an [`IncrementalBuilder`], which checks the
//! batch for ambiguous keys and unsummable records once in
//! [`IncrementalBuilder::build`]. The resulting [`Incremental`] only exposes
//! read-only views.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::normalize_ratio;
use crate::error::{PgMapError, RecordKey};
use crate::map::PgMap;
use crate::model::{Epoch, NodeId, NodeRecord, PgId, PgRecord, PoolId, Timestamp, Version};

/// Node stat report together with the epoch it was generated under.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeReport {
    pub epoch: Epoch,
    pub record: NodeRecord,
}

/// Validated batch of changes built against one map version.
#[derive(Clone, Debug, PartialEq)]
pub struct Incremental {
    base_version: Version,
    stamp: Timestamp,
    cluster_epoch: Option<Epoch>,
    pg_scan: Option<Epoch>,
    ratios: Option<(f64, f64)>,
    pg_updates: BTreeMap<PgId, PgRecord>,
    pg_removals: BTreeSet<PgId>,
    pool_removals: BTreeSet<PoolId>,
    node_updates: BTreeMap<NodeId, NodeReport>,
    node_removals: BTreeSet<NodeId>,
}

impl Incremental {
    /// Starts a batch against `base_version`, stamped `stamp`.
    pub fn builder(base_version: Version, stamp: Timestamp) -> IncrementalBuilder {
        IncrementalBuilder::new(base_version, stamp)
    }

    /// Map version this batch was built against.
    pub fn base_version(&self) -> Version {
        self.base_version
    }

    pub fn stamp(&self) -> Timestamp {
        self.stamp
    }

    /// Cluster-membership epoch to advance to, if any.
    pub fn cluster_epoch(&self) -> Option<Epoch> {
        self.cluster_epoch
    }

    /// Epoch of a completed PG-creation scan, if any.
    pub fn pg_scan(&self) -> Option<Epoch> {
        self.pg_scan
    }

    /// New (full, nearfull) ratios, if any.
    pub fn ratios(&self) -> Option<(f64, f64)> {
        self.ratios
    }

    pub fn pg_updates(&self) -> &BTreeMap<PgId, PgRecord> {
        &self.pg_updates
    }

    pub fn pg_removals(&self) -> &BTreeSet<PgId> {
        &self.pg_removals
    }

    pub fn pool_removals(&self) -> &BTreeSet<PoolId> {
        &self.pool_removals
    }

    pub fn node_updates(&self) -> &BTreeMap<NodeId, NodeReport> {
        &self.node_updates
    }

    pub fn node_removals(&self) -> &BTreeSet<NodeId> {
        &self.node_removals
    }

    /// True if the batch carries no change besides its stamp.
    pub fn is_empty(&self) -> bool {
        self.cluster_epoch.is_none()
            && self.pg_scan.is_none()
            && self.ratios.is_none()
            && self.pg_updates.is_empty()
            && self.pg_removals.is_empty()
            && self.pool_removals.is_empty()
            && self.node_updates.is_empty()
            && self.node_removals.is_empty()
    }
}

/// Mutable collector for an [`Incremental`].
///
/// Upserting the same key twice keeps the last write.
#[derive(Clone, Debug)]
pub struct IncrementalBuilder {
    inner: Incremental,
}

impl IncrementalBuilder {
    pub fn new(base_version: Version, stamp: Timestamp) -> Self {
        Self {
            inner: Incremental {
                base_version,
                stamp,
                cluster_epoch: None,
                pg_scan: None,
                ratios: None,
                pg_updates: BTreeMap::new(),
                pg_removals: BTreeSet::new(),
                pool_removals: BTreeSet::new(),
                node_updates: BTreeMap::new(),
                node_removals: BTreeSet::new(),
            },
        }
    }

    pub fn upsert_pg(&mut self, id: PgId, record: PgRecord) {
        self.inner.pg_updates.insert(id, record);
    }

    pub fn remove_pg(&mut self, id: PgId) {
        self.inner.pg_removals.insert(id);
    }

    /// Removes a pool with all of its PGs and rate history.
    pub fn remove_pool(&mut self, pool: PoolId) {
        self.inner.pool_removals.insert(pool);
    }

    pub fn upsert_node(&mut self, id: NodeId, epoch: Epoch, record: NodeRecord) {
        self.inner
            .node_updates
            .insert(id, NodeReport { epoch, record });
    }

    pub fn remove_node(&mut self, id: NodeId) {
        self.inner.node_removals.insert(id);
    }

    /// Node went down and came back up at `epoch`: its op-queue-age history
    /// no longer applies.
    ///
    /// Zeroes the histogram of this batch's pending report for the node if
    /// there is one, otherwise of a copy of the record `map` holds (re-tagged
    /// with `epoch`). A node with neither is left alone.
    pub fn node_down_up(&mut self, id: NodeId, epoch: Epoch, map: &PgMap) {
        if let Some(report) = self.inner.node_updates.get_mut(&id) {
            report.record.op_queue_age_hist.clear();
            return;
        }
        if let Some(current) = map.node(id) {
            let mut record = current.clone();
            record.op_queue_age_hist.clear();
            self.inner
                .node_updates
                .insert(id, NodeReport { epoch, record });
        }
    }

    /// Node marked out at `epoch`: it keeps its entry but reports no capacity.
    pub fn node_out(&mut self, id: NodeId, epoch: Epoch) {
        self.upsert_node(id, epoch, NodeRecord::default());
    }

    pub fn set_cluster_epoch(&mut self, epoch: Epoch) {
        self.inner.cluster_epoch = Some(epoch);
    }

    /// Records that PG creation was scanned for at `epoch`.
    pub fn set_pg_scan(&mut self, epoch: Epoch) {
        self.inner.pg_scan = Some(epoch);
    }

    /// Ratios above 1.0 are taken as percentages.
    pub fn set_ratios(&mut self, full: f64, nearfull: f64) {
        self.inner.ratios = Some((normalize_ratio(full), normalize_ratio(nearfull)));
    }

    /// Validates the batch and freezes it.
    ///
    /// Fails with [`PgMapError::AmbiguousUpdate`] if a node or PG is both
    /// upserted and removed, or a PG is upserted into a pool being removed,
    /// and with [`PgMapError::InvalidRecord`] if an upserted record carries a
    /// negative counter or histogram bucket or an oversized byte count.
    pub fn build(self) -> Result<Incremental, PgMapError> {
        let inc = self.inner;
        for (&id, rec) in &inc.pg_updates {
            if let Some(field) = rec.first_invalid() {
                return Err(PgMapError::InvalidRecord {
                    key: RecordKey::Pg(id),
                    field,
                });
            }
        }
        for (&id, report) in &inc.node_updates {
            if let Some(field) = report.record.first_invalid() {
                return Err(PgMapError::InvalidRecord {
                    key: RecordKey::Node(id),
                    field,
                });
            }
        }
        if let Some(&node) = inc
            .node_updates
            .keys()
            .find(|id| inc.node_removals.contains(*id))
        {
            return Err(PgMapError::AmbiguousUpdate(RecordKey::Node(node)));
        }
        if let Some(&pg) = inc
            .pg_updates
            .keys()
            .find(|id| inc.pg_removals.contains(*id))
        {
            return Err(PgMapError::AmbiguousUpdate(RecordKey::Pg(pg)));
        }
        if let Some(pg) = inc
            .pg_updates
            .keys()
            .find(|id| inc.pool_removals.contains(&id.pool))
        {
            return Err(PgMapError::AmbiguousUpdate(RecordKey::Pool(pg.pool)));
        }
        Ok(inc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PgState, Pow2Histogram};

    fn busy_node() -> NodeRecord {
        NodeRecord {
            op_queue_age_hist: Pow2Histogram::from_buckets(vec![4, 2, 1]),
            ..NodeRecord::with_usage(1000, 100)
        }
    }

    #[test]
    fn test_last_write_wins() {
        let mut b = Incremental::builder(1, 10);
        let id = PgId::new(1, 0);
        b.upsert_pg(
            id,
            PgRecord {
                state: PgState::CREATING,
                ..PgRecord::default()
            },
        );
        b.upsert_pg(
            id,
            PgRecord {
                state: PgState::ACTIVE,
                ..PgRecord::default()
            },
        );
        let inc = b.build().unwrap();
        assert_eq!(inc.pg_updates().len(), 1);
        assert_eq!(inc.pg_updates()[&id].state, PgState::ACTIVE);
    }

    #[test]
    fn test_pg_in_both_sets_rejected() {
        let mut b = Incremental::builder(0, 0);
        let id = PgId::new(2, 7);
        b.upsert_pg(id, PgRecord::default());
        b.remove_pg(id);
        assert_eq!(
            b.build(),
            Err(PgMapError::AmbiguousUpdate(RecordKey::Pg(id)))
        );
    }

    #[test]
    fn test_node_in_both_sets_rejected() {
        let mut b = Incremental::builder(0, 0);
        b.upsert_node(3, 5, NodeRecord::default());
        b.remove_node(3);
        assert_eq!(
            b.build(),
            Err(PgMapError::AmbiguousUpdate(RecordKey::Node(3)))
        );
    }

    #[test]
    fn test_pg_upsert_into_removed_pool_rejected() {
        let mut b = Incremental::builder(0, 0);
        b.upsert_pg(PgId::new(4, 1), PgRecord::default());
        b.remove_pool(4);
        assert_eq!(
            b.build(),
            Err(PgMapError::AmbiguousUpdate(RecordKey::Pool(4)))
        );
    }

    #[test]
    fn test_node_down_up_clears_pending_report() {
        let map = PgMap::default();
        let mut b = Incremental::builder(0, 0);
        b.upsert_node(1, 7, busy_node());
        b.node_down_up(1, 8, &map);
        let inc = b.build().unwrap();
        let report = &inc.node_updates()[&1];
        assert!(report.record.op_queue_age_hist.is_empty());
        assert_eq!(report.epoch, 7);
    }

    #[test]
    fn test_node_down_up_copies_stored_record() {
        let mut map = PgMap::default();
        map.upsert_node(1, 7, busy_node()).unwrap();
        let mut b = Incremental::builder(map.version(), 0);
        b.node_down_up(1, 9, &map);
        let inc = b.build().unwrap();
        let report = &inc.node_updates()[&1];
        assert_eq!(report.epoch, 9);
        assert!(report.record.op_queue_age_hist.is_empty());
        assert_eq!(report.record.total_bytes, 1000);
    }

    #[test]
    fn test_node_down_up_unknown_node_is_noop() {
        let map = PgMap::default();
        let mut b = Incremental::builder(0, 0);
        b.node_down_up(42, 3, &map);
        let inc = b.build().unwrap();
        assert!(inc.is_empty());
    }

    #[test]
    fn test_node_out_zeroes_capacity() {
        let mut b = Incremental::builder(0, 0);
        b.node_out(5, 11);
        let inc = b.build().unwrap();
        assert_eq!(inc.node_updates()[&5].record, NodeRecord::default());
        assert_eq!(inc.node_updates()[&5].epoch, 11);
    }

    #[test]
    fn test_negative_pg_counter_rejected() {
        let mut b = Incremental::builder(0, 0);
        let bad = PgId::new(1, 0);
        let mut rec = PgRecord::default();
        rec.stats.num_bytes = -5;
        b.upsert_pg(bad, rec);
        b.upsert_pg(PgId::new(1, 1), PgRecord::default());
        assert_eq!(
            b.build(),
            Err(PgMapError::InvalidRecord {
                key: RecordKey::Pg(bad),
                field: "num_bytes"
            })
        );
    }

    #[test]
    fn test_unsummable_node_rejected() {
        let mut b = Incremental::builder(0, 0);
        b.upsert_node(0, 1, NodeRecord::with_usage(u64::MAX, 1));
        assert_eq!(
            b.build(),
            Err(PgMapError::InvalidRecord {
                key: RecordKey::Node(0),
                field: "total_bytes"
            })
        );

        let mut b = Incremental::builder(0, 0);
        b.upsert_node(
            2,
            1,
            NodeRecord {
                op_queue_age_hist: Pow2Histogram::from_buckets(vec![3, -1]),
                ..NodeRecord::default()
            },
        );
        assert_eq!(
            b.build(),
            Err(PgMapError::InvalidRecord {
                key: RecordKey::Node(2),
                field: "op_queue_age_hist"
            })
        );
    }

    #[test]
    fn test_pg_scan_carried() {
        let mut b = Incremental::builder(0, 0);
        assert!(b.clone().build().unwrap().pg_scan().is_none());
        b.set_pg_scan(12);
        let inc = b.build().unwrap();
        assert_eq!(inc.pg_scan(), Some(12));
        assert!(!inc.is_empty());
    }

    #[test]
    fn test_ratios_normalized() {
        let mut b = Incremental::builder(0, 0);
        b.set_ratios(97.0, 0.9);
        let (full, nearfull) = b.build().unwrap().ratios().unwrap();
        assert!((full - 0.97).abs() < 1e-12);
        assert_eq!(nearfull, 0.9);
    }
}
