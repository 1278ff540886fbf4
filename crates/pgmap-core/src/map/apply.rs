//! Applying a committed [`Incremental`] to the map.
//!
//! Validate, then apply: a batch is either rejected before any mutation
//! (version conflict, epoch regression) or applied in full. Within a batch
//! the order is node removals, node upserts, pool and PG removals, PG
//! upserts, ratios, epoch/pg-scan/stamp, then delta folding. Records were
//! validated when the batch was built, so they go in unchecked.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use super::{FullnessChange, PgMap};
use crate::delta::DeltaTracker;
use crate::error::PgMapError;
use crate::incremental::Incremental;
use crate::model::{Epoch, NodeId, PoolId, PoolStatSum, Timestamp, Version};

/// Node report dropped because the map already holds a newer epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StaleReport {
    pub node: NodeId,
    pub stored: Epoch,
    pub reported: Epoch,
}

/// Result of a successful [`PgMap::apply_incremental`].
#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct ApplyOutcome {
    /// Map version after the apply.
    pub version: Version,
    /// Node reports skipped as stale.
    pub stale_nodes: Vec<StaleReport>,
    /// Full/nearfull transitions caused by node upserts or a ratio change.
    pub fullness_changes: Vec<FullnessChange>,
}

impl PgMap {
    /// Applies `inc` and advances the version by one.
    ///
    /// Fails without touching the map if `inc` was built against another
    /// version ([`PgMapError::VersionConflict`]) or would move the cluster
    /// epoch backwards ([`PgMapError::EpochRegression`]). Stale node reports
    /// inside the batch are dropped individually and listed in the outcome.
    pub fn apply_incremental(&mut self, inc: &Incremental) -> Result<ApplyOutcome, PgMapError> {
        if inc.base_version() != self.version {
            warn!(
                version = self.version,
                base_version = inc.base_version(),
                "pgmap: rejecting incremental built against another version"
            );
            return Err(PgMapError::VersionConflict {
                expected: self.version,
                found: inc.base_version(),
            });
        }
        if let Some(epoch) = inc.cluster_epoch() {
            if epoch < self.last_epoch {
                warn!(
                    current = self.last_epoch,
                    proposed = epoch,
                    "pgmap: rejecting incremental with epoch regression"
                );
                return Err(PgMapError::EpochRegression {
                    current: self.last_epoch,
                    proposed: epoch,
                });
            }
        }

        let pre_pools = self.pool_sums.clone();
        let pre_global = self.sum.pg.clone();
        let mut outcome = ApplyOutcome::default();

        for &id in inc.node_removals() {
            self.remove_node(id);
        }
        for (&id, report) in inc.node_updates() {
            match self.try_upsert_node(id, report.epoch, report.record.clone()) {
                Ok(Some(change)) => outcome.fullness_changes.push(change),
                Ok(None) => {}
                Err(stale) => {
                    warn!(
                        node = stale.node,
                        stored = stale.stored,
                        reported = stale.reported,
                        "pgmap: dropping stale node report"
                    );
                    outcome.stale_nodes.push(stale);
                }
            }
        }

        for &pool in inc.pool_removals() {
            self.remove_pool(pool);
        }
        for &id in inc.pg_removals() {
            self.remove_pg(id);
        }
        for (&id, rec) in inc.pg_updates() {
            self.put_pg(id, rec.clone());
        }

        if let Some((full, nearfull)) = inc.ratios() {
            outcome
                .fullness_changes
                .extend(self.set_ratios(full, nearfull));
        }

        if let Some(epoch) = inc.cluster_epoch() {
            self.last_epoch = epoch;
        }
        if let Some(epoch) = inc.pg_scan() {
            self.last_pg_scan = epoch;
        }
        self.stamp = inc.stamp();

        self.fold_deltas(&pre_pools, &pre_global, inc.stamp());

        self.version += 1;
        self.min_last_epoch_clean.invalidate();
        self.assert_node_cardinality();

        outcome.version = self.version;
        debug!(
            version = self.version,
            pg_updates = inc.pg_updates().len(),
            pg_removals = inc.pg_removals().len(),
            node_updates = inc.node_updates().len(),
            node_removals = inc.node_removals().len(),
            stale = outcome.stale_nodes.len(),
            "pgmap: incremental applied"
        );
        Ok(outcome)
    }

    /// Feeds (pre, post) sums of every known pool and of the global PG sum
    /// to their delta trackers. Pools first seen in this pass get a fresh
    /// tracker.
    fn fold_deltas(
        &mut self,
        pre_pools: &BTreeMap<PoolId, PoolStatSum>,
        pre_global: &PoolStatSum,
        stamp: Timestamp,
    ) {
        let window = self.delta_window;
        let empty = PoolStatSum::default();
        for (pool, post) in &self.pool_sums {
            let pre = pre_pools.get(pool).unwrap_or(&empty);
            self.pool_deltas
                .entry(*pool)
                .or_insert_with(|| DeltaTracker::new(window))
                .fold(pre, post, stamp);
        }
        self.global_delta.fold(pre_global, &self.sum.pg, stamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::delta::IoRate;
    use crate::map::Fullness;
    use crate::model::{NodeRecord, ObjectStatSum, PgId, PgRecord, PgState};

    fn io_pg(rd: i64, rd_bytes: i64, wr: i64, wr_bytes: i64) -> PgRecord {
        PgRecord {
            state: PgState::ACTIVE | PgState::CLEAN,
            acting: vec![0],
            up: vec![0],
            stats: ObjectStatSum {
                num_objects: 1,
                num_rd: rd,
                num_rd_bytes: rd_bytes,
                num_wr: wr,
                num_wr_bytes: wr_bytes,
                ..ObjectStatSum::default()
            },
            ..PgRecord::default()
        }
    }

    fn apply(map: &mut PgMap, stamp: Timestamp, f: impl FnOnce(&mut crate::IncrementalBuilder)) {
        let mut b = Incremental::builder(map.version(), stamp);
        f(&mut b);
        map.apply_incremental(&b.build().unwrap()).unwrap();
    }

    #[test]
    fn test_version_advances_and_conflict_rejected() {
        let mut map = PgMap::default();
        let mut b = Incremental::builder(0, 1_000);
        b.upsert_pg(PgId::new(1, 0), io_pg(0, 0, 0, 0));
        let inc = b.build().unwrap();

        let out = map.apply_incremental(&inc).unwrap();
        assert_eq!(out.version, 1);
        assert_eq!(map.version(), 1);
        assert_eq!(map.stamp(), 1_000);

        let before = map.to_snapshot();
        assert_eq!(
            map.apply_incremental(&inc),
            Err(PgMapError::VersionConflict {
                expected: 1,
                found: 0
            })
        );
        assert_eq!(map.to_snapshot(), before);
    }

    #[test]
    fn test_epoch_regression_rejected_without_mutation() {
        let mut map = PgMap::default();
        apply(&mut map, 1_000, |b| b.set_cluster_epoch(20));
        assert_eq!(map.last_epoch(), 20);

        let mut b = Incremental::builder(map.version(), 2_000);
        b.set_cluster_epoch(19);
        b.upsert_pg(PgId::new(1, 0), io_pg(0, 0, 0, 0));
        let before = map.to_snapshot();
        assert_eq!(
            map.apply_incremental(&b.build().unwrap()),
            Err(PgMapError::EpochRegression {
                current: 20,
                proposed: 19
            })
        );
        assert_eq!(map.to_snapshot(), before);
    }

    #[test]
    fn test_stale_node_report_dropped_rest_applied() {
        let mut map = PgMap::default();
        apply(&mut map, 1_000, |b| {
            b.upsert_node(1, 10, NodeRecord::with_usage(100, 10));
        });

        let mut b = Incremental::builder(map.version(), 2_000);
        b.upsert_node(1, 9, NodeRecord::with_usage(100, 99));
        b.upsert_node(2, 3, NodeRecord::with_usage(100, 20));
        let out = map.apply_incremental(&b.build().unwrap()).unwrap();

        assert_eq!(
            out.stale_nodes,
            vec![StaleReport {
                node: 1,
                stored: 10,
                reported: 9
            }]
        );
        assert_eq!(map.node(1).unwrap().used_bytes, 10);
        assert_eq!(map.node_epoch(2), Some(3));
        assert_eq!(map.version(), 2);
    }

    #[test]
    fn test_ratio_change_reported_in_outcome() {
        let mut map = PgMap::new(&MapConfig::default());
        apply(&mut map, 1_000, |b| {
            b.upsert_node(0, 1, NodeRecord::with_usage(100, 96));
        });
        assert_eq!(map.fullness(0), Fullness::Full);

        let mut b = Incremental::builder(map.version(), 2_000);
        b.set_ratios(0.97, 0.85);
        let out = map.apply_incremental(&b.build().unwrap()).unwrap();
        assert_eq!(out.fullness_changes.len(), 1);
        assert_eq!(out.fullness_changes[0].to, Fullness::Nearfull);
        assert_eq!(map.full_ratio(), 0.97);
    }

    #[test]
    fn test_pool_rates_from_applied_updates() {
        let mut map = PgMap::default();
        let id = PgId::new(3, 0);
        apply(&mut map, 1_000, |b| b.upsert_pg(id, io_pg(0, 0, 0, 0)));
        // first pass seeds the trackers
        assert_eq!(map.pool_io_rate(3, None), Some(IoRate::default()));

        apply(&mut map, 3_000, |b| b.upsert_pg(id, io_pg(200, 8192, 0, 0)));
        apply(&mut map, 5_000, |b| b.upsert_pg(id, io_pg(200, 8192, 100, 4096)));

        let rate = map.pool_io_rate(3, None).unwrap();
        assert_eq!(rate.read_ops_sec, 50.0);
        assert_eq!(rate.read_bytes_sec, 2048.0);
        assert_eq!(rate.write_ops_sec, 25.0);
        assert_eq!(rate.write_bytes_sec, 1024.0);

        let recent = map.pool_io_rate(3, Some(1)).unwrap();
        assert_eq!(recent.read_ops_sec, 0.0);
        assert_eq!(recent.write_ops_sec, 50.0);

        assert_eq!(map.global_io_rate(None), rate);
        assert_eq!(map.pool_io_rate(99, None), None);
    }

    #[test]
    fn test_duplicate_stamp_sample_ignored() {
        let mut map = PgMap::default();
        let id = PgId::new(1, 0);
        apply(&mut map, 1_000, |b| b.upsert_pg(id, io_pg(0, 0, 0, 0)));
        apply(&mut map, 2_000, |b| b.upsert_pg(id, io_pg(10, 0, 0, 0)));
        let before = map.pool_delta(1).cloned();

        apply(&mut map, 2_000, |b| b.upsert_pg(id, io_pg(20, 0, 0, 0)));
        assert_eq!(map.pool_delta(1).cloned(), before);
        assert_eq!(map.version(), 3);
    }

    #[test]
    fn test_pool_removal_purges_history() {
        let mut map = PgMap::default();
        apply(&mut map, 1_000, |b| {
            b.upsert_pg(PgId::new(1, 0), io_pg(0, 0, 0, 0));
            b.upsert_pg(PgId::new(1, 1), io_pg(0, 0, 0, 0));
            b.upsert_pg(PgId::new(2, 0), io_pg(0, 0, 0, 0));
        });
        apply(&mut map, 2_000, |b| {
            b.upsert_pg(PgId::new(1, 0), io_pg(5, 0, 0, 0));
        });
        assert!(map.pool_delta(1).is_some_and(|t| t.len() == 1));

        apply(&mut map, 3_000, |b| b.remove_pool(1));
        assert!(map.pool_delta(1).is_none());
        assert_eq!(map.pool_io_rate(1, None), None);
        assert_eq!(map.global_sum().pg.num_pg, 1);
        assert_eq!(map.global_sum().pg.stats.num_rd, 0);
        assert!(map.sums_consistent());
    }

    #[test]
    fn test_removal_applied_before_upsert_order() {
        let mut map = PgMap::default();
        apply(&mut map, 1_000, |b| {
            b.upsert_node(1, 1, NodeRecord::with_usage(100, 10));
            b.upsert_pg(PgId::new(1, 0), io_pg(0, 0, 0, 0));
        });
        apply(&mut map, 2_000, |b| {
            b.remove_node(1);
            b.upsert_node(2, 4, NodeRecord::with_usage(100, 10));
            b.remove_pg(PgId::new(1, 0));
            b.upsert_pg(PgId::new(1, 1), io_pg(0, 0, 0, 0));
        });
        assert!(map.node(1).is_none());
        assert_eq!(map.node_epoch(2), Some(4));
        assert!(map.pg(PgId::new(1, 0)).is_none());
        assert!(map.pg(PgId::new(1, 1)).is_some());
        assert_eq!(map.node_epochs().len(), map.nodes().len());
    }

    #[test]
    fn test_recovery_rate_from_applied_updates() {
        let mut map = PgMap::default();
        let id = PgId::new(2, 0);
        let recovering = |objects: i64, bytes: i64| PgRecord {
            state: PgState::ACTIVE | PgState::RECOVERING,
            acting: vec![0],
            stats: ObjectStatSum {
                num_objects: 100,
                num_objects_recovered: objects,
                num_bytes_recovered: bytes,
                ..ObjectStatSum::default()
            },
            ..PgRecord::default()
        };
        apply(&mut map, 10_000, |b| b.upsert_pg(id, recovering(0, 0)));
        apply(&mut map, 12_000, |b| b.upsert_pg(id, recovering(30, 3 << 20)));
        apply(&mut map, 14_000, |b| b.upsert_pg(id, recovering(50, 5 << 20)));

        let rate = map.pool_io_rate(2, None).unwrap();
        assert_eq!(rate.recovered_objects_sec, 12.5);
        assert_eq!(rate.recovered_bytes_sec, 1_310_720.0);
        assert!(rate.is_idle());

        let recent = map.global_io_rate(Some(1));
        assert_eq!(recent.recovered_objects_sec, 10.0);
    }

    #[test]
    fn test_pg_scan_recorded() {
        let mut map = PgMap::default();
        apply(&mut map, 1_000, |b| b.set_pg_scan(7));
        assert_eq!(map.last_pg_scan(), 7);
        apply(&mut map, 2_000, |_| {});
        assert_eq!(map.last_pg_scan(), 7);
    }

    #[test]
    fn test_blocked_and_creating_indexes_follow_records() {
        let mut map = PgMap::default();
        let peering = PgRecord {
            state: PgState::PEERING,
            acting: vec![1, 2],
            blocked_by: vec![3, 4],
            ..PgRecord::default()
        };
        let creating = PgRecord {
            state: PgState::CREATING,
            acting: vec![2],
            ..PgRecord::default()
        };
        apply(&mut map, 1_000, |b| {
            b.upsert_pg(PgId::new(1, 0), peering.clone());
            b.upsert_pg(PgId::new(1, 1), PgRecord { blocked_by: vec![3], ..peering });
            b.upsert_pg(PgId::new(1, 2), creating);
        });
        assert_eq!(map.blocked_by_sum().get(&3), Some(&2));
        assert_eq!(map.blocked_by_sum().get(&4), Some(&1));
        assert_eq!(map.creating_pgs().len(), 1);
        assert!(map.creating_pgs_on_node(2).unwrap().contains(&PgId::new(1, 2)));

        apply(&mut map, 2_000, |b| {
            b.upsert_pg(PgId::new(1, 0), io_pg(0, 0, 0, 0));
            b.upsert_pg(PgId::new(1, 2), io_pg(0, 0, 0, 0));
        });
        assert_eq!(map.blocked_by_sum().get(&3), Some(&1));
        assert!(map.blocked_by_sum().get(&4).is_none());
        assert!(map.creating_pgs().is_empty());
        assert!(map.creating_pgs_on_node(2).is_none());
    }

    #[test]
    fn test_apply_invalidates_min_last_epoch_clean() {
        let mut map = PgMap::default();
        map.recompute_aggregates();
        assert!(map.cached_min_last_epoch_clean().is_some());
        apply(&mut map, 1_000, |_| {});
        assert_eq!(map.cached_min_last_epoch_clean(), None);
        assert_eq!(map.min_last_epoch_clean(), 0);
    }
}
