//! Combined PG selection by state, pool and node.

use super::PgMap;
use crate::model::{NodeId, PgId, PgRecord, PgState, PoolId};

/// Criteria for [`PgMap::filtered_pgs`]. Unset criteria match everything;
/// set ones must all match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PgFilter {
    /// Matches PGs with any of these state bits.
    pub state: Option<PgState>,
    pub pool: Option<PoolId>,
    /// Matches PGs whose up or acting set contains the node.
    pub node: Option<NodeId>,
    /// With `node`, match only PGs the node is acting primary for.
    pub primary_only: bool,
}

impl PgFilter {
    pub fn state(mut self, state: PgState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn pool(mut self, pool: PoolId) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn primary_only(mut self) -> Self {
        self.primary_only = true;
        self
    }

    pub fn matches(&self, id: PgId, rec: &PgRecord) -> bool {
        if self.pool.is_some_and(|pool| id.pool != pool) {
            return false;
        }
        if self.state.is_some_and(|state| !rec.state.intersects(state)) {
            return false;
        }
        match self.node {
            Some(node) if self.primary_only => rec.acting_primary() == Some(node),
            Some(node) => rec.up.contains(&node) || rec.acting.contains(&node),
            None => true,
        }
    }
}

impl PgMap {
    /// PGs matching `filter`, in id order.
    ///
    /// A node filter walks the node -> PG index and a pool filter the pool's
    /// id range, so neither scans the whole map.
    pub fn filtered_pgs(&self, filter: &PgFilter) -> Vec<(PgId, &PgRecord)> {
        if let Some(node) = filter.node {
            let Some(ids) = self.pgs_by_node.get(&node) else {
                return Vec::new();
            };
            return ids
                .iter()
                .filter_map(|id| self.pg_stat.get(id).map(|rec| (*id, rec)))
                .filter(|(id, rec)| filter.matches(*id, rec))
                .collect();
        }
        let candidates: Box<dyn Iterator<Item = (&PgId, &PgRecord)> + '_> = match filter.pool {
            Some(pool) => Box::new(self.pool_pgs(pool)),
            None => Box::new(self.pg_stat.iter()),
        };
        candidates
            .filter(|(id, rec)| filter.matches(**id, rec))
            .map(|(id, rec)| (*id, rec))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::Incremental;

    fn pg(state: PgState, up: &[NodeId], acting: &[NodeId]) -> PgRecord {
        PgRecord {
            state,
            up: up.to_vec(),
            acting: acting.to_vec(),
            ..PgRecord::default()
        }
    }

    fn map() -> PgMap {
        let mut map = PgMap::default();
        let mut b = Incremental::builder(0, 1_000);
        b.upsert_pg(PgId::new(1, 0), pg(PgState::ACTIVE | PgState::CLEAN, &[0, 1], &[0, 1]));
        b.upsert_pg(PgId::new(1, 1), pg(PgState::ACTIVE | PgState::DEGRADED, &[1, 2], &[1]));
        b.upsert_pg(PgId::new(2, 0), pg(PgState::PEERING, &[2, 0], &[2, 0]));
        b.upsert_pg(PgId::new(2, 1), pg(PgState::ACTIVE | PgState::DEGRADED, &[3], &[0, 3]));
        map.apply_incremental(&b.build().unwrap()).unwrap();
        map
    }

    fn ids(found: Vec<(PgId, &PgRecord)>) -> Vec<String> {
        found.into_iter().map(|(id, _)| id.to_string()).collect()
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let map = map();
        assert_eq!(map.filtered_pgs(&PgFilter::default()).len(), 4);
    }

    #[test]
    fn test_state_matches_any_bit() {
        let map = map();
        let f = PgFilter::default().state(PgState::DEGRADED | PgState::PEERING);
        assert_eq!(ids(map.filtered_pgs(&f)), vec!["1.1", "2.0", "2.1"]);
    }

    #[test]
    fn test_pool_and_state_combined() {
        let map = map();
        let f = PgFilter::default().pool(2).state(PgState::ACTIVE);
        assert_eq!(ids(map.filtered_pgs(&f)), vec!["2.1"]);
        assert!(map.filtered_pgs(&PgFilter::default().pool(9)).is_empty());
    }

    #[test]
    fn test_node_and_primary() {
        let map = map();
        let on_0 = PgFilter::default().node(0);
        assert_eq!(ids(map.filtered_pgs(&on_0)), vec!["1.0", "2.0", "2.1"]);

        let primary_0 = on_0.primary_only();
        assert_eq!(ids(map.filtered_pgs(&primary_0)), vec!["1.0", "2.1"]);

        let degraded_primary_0 = primary_0.state(PgState::DEGRADED);
        assert_eq!(ids(map.filtered_pgs(&degraded_primary_0)), vec!["2.1"]);

        assert!(map.filtered_pgs(&PgFilter::default().node(42)).is_empty());
    }
}
