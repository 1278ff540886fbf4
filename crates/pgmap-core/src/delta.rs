//! Rolling delta windows and rate estimation.
//!
//! One [`DeltaTracker`] exists per pool plus one for the global PG sum. Each
//! applied incremental folds its (pre, post) sums into the tracker; the
//! tracker keeps a bounded window of per-update deltas together with the
//! time span each covers, and a running total of both so the rate over the
//! whole window is O(1).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{PoolStatSum, Timestamp};

/// Sum and stamp the next delta is measured from.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Baseline {
    pub sum: PoolStatSum,
    pub stamp: Timestamp,
}

/// One retained delta.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DeltaSample {
    /// post - pre for the update that produced this sample.
    pub delta: PoolStatSum,
    /// Stamp of that update.
    pub stamp: Timestamp,
    /// Milliseconds since the previous baseline.
    pub span_ms: i64,
}

/// What [`DeltaTracker::fold`] did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// First sample; only the baseline was set.
    Seeded,
    /// Sample retained.
    Appended,
    /// Sample retained and the oldest one evicted.
    AppendedEvicting,
    /// Non-increasing stamp; tracker unchanged.
    Discarded,
}

/// Per-second throughput derived from retained deltas.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct IoRate {
    pub read_bytes_sec: f64,
    pub write_bytes_sec: f64,
    pub read_ops_sec: f64,
    pub write_ops_sec: f64,
    pub recovered_objects_sec: f64,
    pub recovered_bytes_sec: f64,
}

impl IoRate {
    fn from_delta(delta: &PoolStatSum, span_ms: i64) -> Self {
        if span_ms <= 0 {
            return Self::default();
        }
        let secs = span_ms as f64 / 1000.0;
        let s = &delta.stats;
        Self {
            read_bytes_sec: s.num_rd_bytes as f64 / secs,
            write_bytes_sec: s.num_wr_bytes as f64 / secs,
            read_ops_sec: s.num_rd as f64 / secs,
            write_ops_sec: s.num_wr as f64 / secs,
            recovered_objects_sec: s.num_objects_recovered as f64 / secs,
            recovered_bytes_sec: s.num_bytes_recovered as f64 / secs,
        }
    }

    /// True if no client I/O happened in the window.
    pub fn is_idle(&self) -> bool {
        self.read_ops_sec == 0.0 && self.write_ops_sec == 0.0
    }
}

/// Bounded history of deltas for one sum.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DeltaTracker {
    capacity: usize,
    baseline: Option<Baseline>,
    samples: VecDeque<DeltaSample>,
    /// Sum of `samples[*].delta`.
    delta_total: PoolStatSum,
    /// Sum of `samples[*].span_ms`.
    span_total_ms: i64,
}

impl DeltaTracker {
    /// Creates an empty tracker retaining up to `capacity` samples (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            baseline: None,
            samples: VecDeque::with_capacity(capacity),
            delta_total: PoolStatSum::default(),
            span_total_ms: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &DeltaSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Running delta over the retained window.
    pub fn delta_total(&self) -> &PoolStatSum {
        &self.delta_total
    }

    /// Time span covered by the retained window.
    pub fn span_total_ms(&self) -> i64 {
        self.span_total_ms
    }

    /// Folds the sums around one applied update into the window.
    ///
    /// The delta is `post - pre`; its span is `stamp - baseline.stamp`.
    /// A span `<= 0` (duplicate or out-of-order stamp) is ignored.
    pub fn fold(&mut self, pre: &PoolStatSum, post: &PoolStatSum, stamp: Timestamp) -> FoldOutcome {
        let Some(baseline) = &self.baseline else {
            self.baseline = Some(Baseline {
                sum: post.clone(),
                stamp,
            });
            return FoldOutcome::Seeded;
        };

        let span_ms = stamp - baseline.stamp;
        if span_ms <= 0 {
            debug!(
                stamp,
                baseline_stamp = baseline.stamp,
                "delta: non-increasing stamp, sample discarded"
            );
            return FoldOutcome::Discarded;
        }

        let delta = post.delta_from(pre);
        self.delta_total.add(&delta);
        self.span_total_ms += span_ms;
        self.samples.push_back(DeltaSample {
            delta,
            stamp,
            span_ms,
        });
        self.baseline = Some(Baseline {
            sum: post.clone(),
            stamp,
        });

        if self.samples.len() > self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.delta_total.sub(&old.delta);
                self.span_total_ms -= old.span_ms;
            }
            return FoldOutcome::AppendedEvicting;
        }
        FoldOutcome::Appended
    }

    /// Rate over the whole retained window; zero when nothing is retained.
    pub fn rate(&self) -> IoRate {
        IoRate::from_delta(&self.delta_total, self.span_total_ms)
    }

    /// Rate over the most recent `last` retained samples.
    pub fn rate_over(&self, last: usize) -> IoRate {
        if last >= self.samples.len() {
            return self.rate();
        }
        let mut delta = PoolStatSum::default();
        let mut span_ms = 0;
        for s in self.samples.iter().rev().take(last) {
            delta.add(&s.delta);
            span_ms += s.span_ms;
        }
        IoRate::from_delta(&delta, span_ms)
    }

    /// Drops all history, keeping the capacity.
    pub fn reset(&mut self) {
        *self = Self::new(self.capacity);
    }

    /// First way in which the window or its running totals disagree with
    /// the retained samples, if any. Only an imported tracker can fail this.
    pub fn first_inconsistency(&self) -> Option<&'static str> {
        if self.capacity == 0 {
            return Some("zero capacity");
        }
        if self.samples.len() > self.capacity {
            return Some("more samples than capacity");
        }
        if !self.samples.is_empty() && self.baseline.is_none() {
            return Some("samples without a baseline");
        }

        let mut delta = PoolStatSum::default();
        let mut span_ms: i64 = 0;
        let mut newest: Option<Timestamp> = None;
        for s in &self.samples {
            if s.span_ms <= 0 {
                return Some("non-positive sample span");
            }
            if newest.is_some_and(|prev| s.stamp <= prev) {
                return Some("sample stamps not increasing");
            }
            newest = Some(s.stamp);
            delta.add(&s.delta);
            span_ms = span_ms.saturating_add(s.span_ms);
        }

        if let (Some(stamp), Some(baseline)) = (newest, &self.baseline) {
            if baseline.stamp != stamp {
                return Some("baseline stamp differs from newest sample");
            }
        }
        if delta != self.delta_total {
            return Some("delta total differs from samples");
        }
        if span_ms != self.span_total_ms {
            return Some("span total differs from samples");
        }
        None
    }
}
