//! Additive aggregates over PG and node records.
//!
//! Counters are signed: the same types carry deltas between two sums, which
//! may legitimately be negative. Sums held by the map must never go negative;
//! [`PoolStatSum::first_negative`] and [`NodeStatSum::first_negative`] name
//! the offending counter so the map can fail loudly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::node::{NodeRecord, Pow2Histogram};
use super::pg::{PgRecord, PgState};

macro_rules! object_counters {
    ($($field:ident),* $(,)?) => {
        /// Object, byte and I/O counters of one PG or a sum of PGs.
        #[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
        pub struct ObjectStatSum {
            $(pub $field: i64,)*
        }

        impl ObjectStatSum {
            pub fn add(&mut self, other: &ObjectStatSum) {
                $(self.$field += other.$field;)*
            }

            pub fn sub(&mut self, other: &ObjectStatSum) {
                $(self.$field -= other.$field;)*
            }

            pub fn is_zero(&self) -> bool {
                true $(&& self.$field == 0)*
            }

            /// Name of the first negative counter, if any.
            pub fn first_negative(&self) -> Option<&'static str> {
                $(if self.$field < 0 {
                    return Some(stringify!($field));
                })*
                None
            }
        }
    };
}

object_counters!(
    num_bytes,
    num_objects,
    num_object_copies,
    num_objects_degraded,
    num_objects_misplaced,
    num_objects_unfound,
    num_rd,
    num_rd_bytes,
    num_wr,
    num_wr_bytes,
    num_objects_recovered,
    num_bytes_recovered,
);

/// Sum over the PG records of one pool (or, globally, of all pools).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct PoolStatSum {
    pub stats: ObjectStatSum,
    pub num_pg: i64,
    /// PG count per exact state bit set. Zero entries are dropped.
    pub num_pg_by_state: BTreeMap<PgState, i64>,
}

impl PoolStatSum {
    /// Adds one PG's contribution.
    pub fn add_pg(&mut self, rec: &PgRecord) {
        self.stats.add(&rec.stats);
        self.num_pg += 1;
        *self.num_pg_by_state.entry(rec.state).or_insert(0) += 1;
    }

    /// Removes one PG's contribution.
    pub fn sub_pg(&mut self, rec: &PgRecord) {
        self.stats.sub(&rec.stats);
        self.num_pg -= 1;
        bump(&mut self.num_pg_by_state, rec.state, -1);
    }

    pub fn add(&mut self, other: &PoolStatSum) {
        self.stats.add(&other.stats);
        self.num_pg += other.num_pg;
        for (&state, &n) in &other.num_pg_by_state {
            bump(&mut self.num_pg_by_state, state, n);
        }
    }

    pub fn sub(&mut self, other: &PoolStatSum) {
        self.stats.sub(&other.stats);
        self.num_pg -= other.num_pg;
        for (&state, &n) in &other.num_pg_by_state {
            bump(&mut self.num_pg_by_state, state, -n);
        }
    }

    /// `self - other`, field-wise.
    pub fn delta_from(&self, other: &PoolStatSum) -> PoolStatSum {
        let mut d = self.clone();
        d.sub(other);
        d
    }

    pub fn is_zero(&self) -> bool {
        self.stats.is_zero() && self.num_pg == 0 && self.num_pg_by_state.is_empty()
    }

    pub fn first_negative(&self) -> Option<&'static str> {
        if let Some(field) = self.stats.first_negative() {
            return Some(field);
        }
        if self.num_pg < 0 {
            return Some("num_pg");
        }
        if self.num_pg_by_state.values().any(|&n| n < 0) {
            return Some("num_pg_by_state");
        }
        None
    }
}

fn bump(counts: &mut BTreeMap<PgState, i64>, state: PgState, by: i64) {
    let entry = counts.entry(state).or_insert(0);
    *entry += by;
    if *entry == 0 {
        counts.remove(&state);
    }
}

/// Sum over node records.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct NodeStatSum {
    pub num_nodes: i64,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub avail_bytes: i64,
    pub op_queue_age_hist: Pow2Histogram,
}

impl NodeStatSum {
    pub fn add_node(&mut self, rec: &NodeRecord) {
        self.num_nodes += 1;
        self.total_bytes += signed_bytes(rec.total_bytes);
        self.used_bytes += signed_bytes(rec.used_bytes);
        self.avail_bytes += signed_bytes(rec.avail_bytes);
        self.op_queue_age_hist.add(&rec.op_queue_age_hist);
    }

    pub fn sub_node(&mut self, rec: &NodeRecord) {
        self.num_nodes -= 1;
        self.total_bytes -= signed_bytes(rec.total_bytes);
        self.used_bytes -= signed_bytes(rec.used_bytes);
        self.avail_bytes -= signed_bytes(rec.avail_bytes);
        self.op_queue_age_hist.sub(&rec.op_queue_age_hist);
    }

    pub fn first_negative(&self) -> Option<&'static str> {
        if self.num_nodes < 0 {
            Some("num_nodes")
        } else if self.total_bytes < 0 {
            Some("total_bytes")
        } else if self.used_bytes < 0 {
            Some("used_bytes")
        } else if self.avail_bytes < 0 {
            Some("avail_bytes")
        } else if self.op_queue_age_hist.has_negative() {
            Some("op_queue_age_hist")
        } else {
            None
        }
    }
}

/// Byte counts past `i64::MAX` are rejected on upsert; clamp rather than wrap.
fn signed_bytes(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Degraded, misplaced and unfound object counts with their ratios.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct RecoverySummary {
    pub objects: i64,
    pub object_copies: i64,
    pub degraded: i64,
    pub misplaced: i64,
    pub unfound: i64,
}

impl RecoverySummary {
    pub fn from_stats(stats: &ObjectStatSum) -> Self {
        Self {
            objects: stats.num_objects,
            object_copies: stats.num_object_copies,
            degraded: stats.num_objects_degraded,
            misplaced: stats.num_objects_misplaced,
            unfound: stats.num_objects_unfound,
        }
    }

    /// Degraded copies over all copies.
    pub fn degraded_ratio(&self) -> f64 {
        ratio(self.degraded, self.object_copies)
    }

    /// Misplaced copies over all copies.
    pub fn misplaced_ratio(&self) -> f64 {
        ratio(self.misplaced, self.object_copies)
    }

    /// Unfound objects over all objects.
    pub fn unfound_ratio(&self) -> f64 {
        ratio(self.unfound, self.objects)
    }

    /// True if nothing is degraded, misplaced or unfound.
    pub fn is_healthy(&self) -> bool {
        self.degraded == 0 && self.misplaced == 0 && self.unfound == 0
    }
}

fn ratio(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Cluster-wide sum: all pools plus all nodes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct GlobalStatSum {
    pub pg: PoolStatSum,
    pub nodes: NodeStatSum,
}
