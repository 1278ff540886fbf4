//! Storage-node stat records.

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Power-of-two bucketed histogram (bucket `i` counts values in `[2^(i-1), 2^i)`).
///
/// Used for op-queue age. Trailing empty buckets are trimmed so that equal
/// distributions compare equal regardless of how they were built.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct Pow2Histogram {
    buckets: Vec<i64>,
}

impl Pow2Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a histogram from raw bucket counts.
    pub fn from_buckets(buckets: Vec<i64>) -> Self {
        let mut h = Self { buckets };
        h.trim();
        h
    }

    pub fn buckets(&self) -> &[i64] {
        &self.buckets
    }

    /// Records one value.
    pub fn record(&mut self, value: u64) {
        let idx = if value == 0 {
            0
        } else {
            (64 - value.leading_zeros()) as usize
        };
        if self.buckets.len() <= idx {
            self.buckets.resize(idx + 1, 0);
        }
        self.buckets[idx] += 1;
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total number of recorded values.
    pub fn total(&self) -> i64 {
        self.buckets.iter().sum()
    }

    /// Exclusive upper bound of the highest non-empty bucket.
    pub fn upper_bound(&self) -> u64 {
        match self.buckets.len() {
            0 => 0,
            n => 1u64 << (n - 1).min(63),
        }
    }

    pub fn add(&mut self, other: &Pow2Histogram) {
        if self.buckets.len() < other.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        for (dst, src) in self.buckets.iter_mut().zip(&other.buckets) {
            *dst += *src;
        }
    }

    pub fn sub(&mut self, other: &Pow2Histogram) {
        if self.buckets.len() < other.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        for (dst, src) in self.buckets.iter_mut().zip(&other.buckets) {
            *dst -= *src;
        }
        self.trim();
    }

    /// True if any bucket went negative.
    pub fn has_negative(&self) -> bool {
        self.buckets.iter().any(|&b| b < 0)
    }

    fn trim(&mut self) {
        while self.buckets.last() == Some(&0) {
            self.buckets.pop();
        }
    }
}

/// Stat snapshot reported by one storage node.
///
/// The epoch the report was generated under is tracked next to the record
/// in the map's node-epoch table.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct NodeRecord {
    /// Raw capacity in bytes.
    pub total_bytes: u64,

    /// Bytes in use.
    pub used_bytes: u64,

    /// Bytes available for new data.
    pub avail_bytes: u64,

    /// Age distribution of queued ops (milliseconds).
    pub op_queue_age_hist: Pow2Histogram,

    /// Heartbeat peers.
    pub hb_peers: Vec<NodeId>,

    /// Number of PGs the node reports hosting.
    pub num_pgs: u32,
}

impl NodeRecord {
    /// Record with the given capacity and usage; avail is the remainder.
    pub fn with_usage(total_bytes: u64, used_bytes: u64) -> Self {
        Self {
            total_bytes,
            used_bytes,
            avail_bytes: total_bytes.saturating_sub(used_bytes),
            ..Self::default()
        }
    }

    /// used/total, or `None` for a node that reports no capacity.
    pub fn used_ratio(&self) -> Option<f64> {
        (self.total_bytes > 0).then(|| self.used_bytes as f64 / self.total_bytes as f64)
    }

    /// Name of the first field the signed node sums cannot carry: a byte
    /// count above `i64::MAX` or a negative histogram bucket.
    pub fn first_invalid(&self) -> Option<&'static str> {
        let max = i64::MAX as u64;
        if self.total_bytes > max {
            Some("total_bytes")
        } else if self.used_bytes > max {
            Some("used_bytes")
        } else if self.avail_bytes > max {
            Some("avail_bytes")
        } else if self.op_queue_age_hist.has_negative() {
            Some("op_queue_age_hist")
        } else {
            None
        }
    }
}
