//! Single-writer / multi-reader access to one [`PgMap`].
//!
//! Applies take the write lock for the whole batch, so readers never observe
//! a record without its matching sum. Queries share the read lock.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::PgMapError;
use crate::incremental::Incremental;
use crate::map::{ApplyOutcome, PgMap, PgMapSnapshot};
use crate::model::{Epoch, Version};

/// Cloneable handle to a map shared between an applier and readers.
#[derive(Clone, Debug)]
pub struct SharedPgMap {
    inner: Arc<RwLock<PgMap>>,
}

impl SharedPgMap {
    pub fn new(map: PgMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, PgMap> {
        // A poisoned lock means a panic mid-apply left records and sums
        // out of step.
        self.inner.read().expect("pg map lock poisoned")
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, PgMap> {
        self.inner.write().expect("pg map lock poisoned")
    }

    /// Applies one committed incremental under the write lock.
    pub fn apply(&self, inc: &Incremental) -> Result<ApplyOutcome, PgMapError> {
        self.write_guard().apply_incremental(inc)
    }

    /// Runs a query under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&PgMap) -> R) -> R {
        f(&self.read_guard())
    }

    /// Runs a mutation under the write lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut PgMap) -> R) -> R {
        f(&mut self.write_guard())
    }

    pub fn version(&self) -> Version {
        self.read(|m| m.version())
    }

    pub fn last_epoch(&self) -> Epoch {
        self.read(|m| m.last_epoch())
    }

    /// Refreshes the min-last-epoch-clean cache if needed; needs the write
    /// lock only when the cache is dirty.
    pub fn min_last_epoch_clean(&self) -> Epoch {
        if let Some(value) = self.read(|m| m.cached_min_last_epoch_clean()) {
            return value;
        }
        self.write(|m| m.min_last_epoch_clean())
    }

    pub fn snapshot(&self) -> PgMapSnapshot {
        self.read(|m| m.to_snapshot())
    }

    /// Replaces the whole map, e.g. after loading a snapshot.
    pub fn replace(&self, map: PgMap) -> PgMap {
        std::mem::replace(&mut *self.write_guard(), map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PgId, PgRecord, PgState};
    use crate::stuck::StuckConditions;
    use std::thread;

    fn unclean_pg(last_change: i64) -> PgRecord {
        PgRecord {
            state: PgState::ACTIVE,
            acting: vec![0],
            last_change,
            last_epoch_clean: 5,
            ..PgRecord::default()
        }
    }

    #[test]
    fn test_readers_see_whole_batches() {
        let shared = SharedPgMap::new(PgMap::default());
        let writer = {
            let shared = shared.clone();
            thread::spawn(move || {
                for v in 0..50u64 {
                    let mut b = Incremental::builder(v, (v as i64 + 1) * 1_000);
                    for seed in 0..8 {
                        b.upsert_pg(PgId::new(1, seed + v as u32 * 8), unclean_pg(0));
                    }
                    shared.apply(&b.build().unwrap()).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        shared.read(|m| {
                            assert_eq!(m.num_pgs() as u64, m.version() * 8);
                            assert_eq!(m.global_sum().pg.num_pg as usize, m.num_pgs());
                        });
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(shared.version(), 50);
        assert_eq!(
            shared.read(|m| m.stuck_pgs(StuckConditions::UNCLEAN, 0).len()),
            400
        );
    }

    #[test]
    fn test_stale_version_rejected_through_handle() {
        let shared = SharedPgMap::new(PgMap::default());
        let inc = Incremental::builder(0, 1).build().unwrap();
        shared.apply(&inc).unwrap();
        assert!(matches!(
            shared.apply(&inc),
            Err(PgMapError::VersionConflict { .. })
        ));
        assert_eq!(shared.version(), 1);
    }

    #[test]
    fn test_rejected_updates_leave_snapshot_unchanged() {
        let shared = SharedPgMap::new(PgMap::default());
        let mut b = Incremental::builder(0, 1_000);
        b.set_cluster_epoch(20);
        b.upsert_pg(PgId::new(1, 0), unclean_pg(0));
        shared.apply(&b.build().unwrap()).unwrap();
        let before = shared.snapshot();

        let mut regress = Incremental::builder(1, 2_000);
        regress.set_cluster_epoch(19);
        regress.remove_pg(PgId::new(1, 0));
        assert_eq!(
            shared.apply(&regress.build().unwrap()),
            Err(PgMapError::EpochRegression {
                current: 20,
                proposed: 19
            })
        );
        assert_eq!(shared.snapshot(), before);

        let mut stale = Incremental::builder(0, 3_000);
        stale.remove_pg(PgId::new(1, 0));
        assert_eq!(
            shared.apply(&stale.build().unwrap()),
            Err(PgMapError::VersionConflict {
                expected: 1,
                found: 0
            })
        );
        assert_eq!(shared.snapshot(), before);
    }

    #[test]
    fn test_invalid_record_keeps_handle_usable() {
        let shared = SharedPgMap::new(PgMap::default());
        let mut bad = unclean_pg(0);
        bad.stats.num_bytes = -5;

        let mut b = Incremental::builder(0, 1_000);
        b.upsert_pg(PgId::new(1, 0), bad.clone());
        b.upsert_pg(PgId::new(1, 1), unclean_pg(0));
        assert!(matches!(b.build(), Err(PgMapError::InvalidRecord { .. })));

        let direct = shared.write(|m| m.upsert_pg(PgId::new(1, 0), bad));
        assert!(matches!(direct, Err(PgMapError::InvalidRecord { .. })));

        let mut b = Incremental::builder(0, 1_000);
        b.upsert_pg(PgId::new(1, 1), unclean_pg(0));
        shared.apply(&b.build().unwrap()).unwrap();
        let mut b = Incremental::builder(1, 2_000);
        b.remove_pg(PgId::new(1, 1));
        shared.apply(&b.build().unwrap()).unwrap();

        assert_eq!(shared.version(), 2);
        assert!(shared.read(|m| m.sums_consistent() && m.num_pgs() == 0));
    }

    #[test]
    fn test_min_last_epoch_clean_through_handle() {
        let shared = SharedPgMap::new(PgMap::default());
        let mut b = Incremental::builder(0, 1);
        b.upsert_pg(PgId::new(1, 0), unclean_pg(0));
        shared.apply(&b.build().unwrap()).unwrap();
        assert_eq!(shared.min_last_epoch_clean(), 5);
        assert_eq!(shared.read(|m| m.cached_min_last_epoch_clean()), Some(5));
    }

    #[test]
    fn test_replace_swaps_map() {
        let shared = SharedPgMap::new(PgMap::default());
        shared.apply(&Incremental::builder(0, 1).build().unwrap()).unwrap();
        let old = shared.replace(PgMap::default());
        assert_eq!(old.version(), 1);
        assert_eq!(shared.version(), 0);
    }
}
