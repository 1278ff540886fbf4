//! Full / near-full node classification.
//!
//! `register_nearfull_status` re-checks one node and is called on every node
//! upsert; `set_ratios` re-checks every node.

use std::fmt;

use serde::Serialize;
use tracing::info;

use super::PgMap;
use crate::config::normalize_ratio;
use crate::model::{NodeId, NodeRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fullness {
    Normal,
    Nearfull,
    Full,
}

impl fmt::Display for Fullness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Fullness::Normal => "normal",
            Fullness::Nearfull => "nearfull",
            Fullness::Full => "full",
        })
    }
}

/// A node moved between full, nearfull and normal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FullnessChange {
    pub node: NodeId,
    pub from: Fullness,
    pub to: Fullness,
}

/// Classifies one node against the given ratios. Nodes without capacity are
/// never full.
pub fn classify(rec: &NodeRecord, full_ratio: f64, nearfull_ratio: f64) -> Fullness {
    match rec.used_ratio() {
        Some(r) if r >= full_ratio => Fullness::Full,
        Some(r) if r >= nearfull_ratio => Fullness::Nearfull,
        _ => Fullness::Normal,
    }
}

impl PgMap {
    /// Re-checks a single node against the current ratios and updates the
    /// full/nearfull sets. Returns the transition, if the class changed.
    pub fn register_nearfull_status(&mut self, id: NodeId) -> Option<FullnessChange> {
        let to = self
            .node_stat
            .get(&id)
            .map(|rec| classify(rec, self.full_ratio, self.nearfull_ratio))
            .unwrap_or(Fullness::Normal);
        let from = self.fullness(id);
        if from == to {
            return None;
        }

        match from {
            Fullness::Full => self.full_nodes.remove(&id),
            Fullness::Nearfull => self.nearfull_nodes.remove(&id),
            Fullness::Normal => false,
        };
        match to {
            Fullness::Full => self.full_nodes.insert(id),
            Fullness::Nearfull => self.nearfull_nodes.insert(id),
            Fullness::Normal => false,
        };
        info!(node = id, %from, %to, "pgmap: node fullness changed");
        Some(FullnessChange { node: id, from, to })
    }

    /// Stores new ratios and re-checks every node. No-op if both ratios are
    /// unchanged. Ratios above 1.0 are taken as percentages.
    pub fn set_ratios(&mut self, full_ratio: f64, nearfull_ratio: f64) -> Vec<FullnessChange> {
        let full_ratio = normalize_ratio(full_ratio);
        let nearfull_ratio = normalize_ratio(nearfull_ratio);
        if full_ratio == self.full_ratio && nearfull_ratio == self.nearfull_ratio {
            return Vec::new();
        }
        info!(
            full_ratio,
            nearfull_ratio,
            old_full_ratio = self.full_ratio,
            old_nearfull_ratio = self.nearfull_ratio,
            "pgmap: ratios changed"
        );
        self.full_ratio = full_ratio;
        self.nearfull_ratio = nearfull_ratio;

        let ids: Vec<NodeId> = self.node_stat.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.register_nearfull_status(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;

    #[test]
    fn test_classify() {
        let rec = NodeRecord::with_usage(100, 96);
        assert_eq!(classify(&rec, 0.95, 0.85), Fullness::Full);
        assert_eq!(classify(&rec, 0.97, 0.85), Fullness::Nearfull);
        assert_eq!(classify(&rec, 0.97, 0.965), Fullness::Normal);
        assert_eq!(classify(&NodeRecord::default(), 0.0, 0.0), Fullness::Normal);
    }

    #[test]
    fn test_raising_full_ratio_moves_node_to_nearfull() {
        let mut map = PgMap::new(&MapConfig::with_ratios(0.95, 0.85));
        let change = map
            .upsert_node(0, 1, NodeRecord::with_usage(100, 96))
            .unwrap();
        assert_eq!(
            change,
            Some(FullnessChange {
                node: 0,
                from: Fullness::Normal,
                to: Fullness::Full
            })
        );
        assert!(map.full_nodes().contains(&0));

        let changes = map.set_ratios(0.97, 0.85);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, Fullness::Nearfull);
        assert!(map.full_nodes().is_empty());
        assert!(map.nearfull_nodes().contains(&0));
    }

    #[test]
    fn test_unchanged_ratios_noop() {
        let mut map = PgMap::default();
        map.upsert_node(0, 1, NodeRecord::with_usage(100, 90)).unwrap();
        assert!(map.set_ratios(0.95, 0.85).is_empty());
        assert!(map.set_ratios(95.0, 85.0).is_empty());
        assert_eq!(map.fullness(0), Fullness::Nearfull);
    }

    #[test]
    fn test_usage_drop_clears_membership() {
        let mut map = PgMap::default();
        map.upsert_node(4, 1, NodeRecord::with_usage(100, 99)).unwrap();
        let change = map.upsert_node(4, 2, NodeRecord::with_usage(100, 50)).unwrap();
        assert_eq!(change.map(|c| c.to), Some(Fullness::Normal));
        assert!(map.full_nodes().is_empty());
        assert!(map.nearfull_nodes().is_empty());
    }

    #[test]
    fn test_rescan_covers_every_node() {
        let mut map = PgMap::default();
        for (id, used) in [(0, 10), (1, 86), (2, 91), (3, 96)] {
            map.upsert_node(id, 1, NodeRecord::with_usage(100, used)).unwrap();
        }
        assert_eq!(map.full_nodes().len(), 1);
        assert_eq!(map.nearfull_nodes().len(), 2);

        map.set_ratios(0.90, 0.50);
        assert_eq!(map.full_nodes().iter().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(map.nearfull_nodes().iter().copied().collect::<Vec<_>>(), vec![1]);
    }
}
