//! Error kinds surfaced by the aggregate.
//!
//! All variants are local, recoverable conditions. Internal invariant
//! violations (epoch/record cardinality mismatch, negative counters) are not
//! represented here: they panic, since they mean the single-writer
//! discipline was broken upstream.

use crate::model::{Epoch, NodeId, PgId, PoolId, Version};

/// Names the record an error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKey {
    Pg(PgId),
    Node(NodeId),
    /// For ambiguous updates: a PG upsert targets a pool the same batch removes.
    Pool(PoolId),
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKey::Pg(id) => write!(f, "pg {}", id),
            RecordKey::Node(id) => write!(f, "node {}", id),
            RecordKey::Pool(id) => write!(f, "pool {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PgMapError {
    /// Update was built against `found`, map is at `expected`.
    VersionConflict { expected: Version, found: Version },
    /// Node report older than the epoch already stored for that node.
    StaleEpoch {
        node: NodeId,
        stored: Epoch,
        reported: Epoch,
    },
    /// Same key in both the upsert and the removal set.
    AmbiguousUpdate(RecordKey),
    /// Cluster epoch advance lower than the map's current epoch.
    EpochRegression { current: Epoch, proposed: Epoch },
    /// Snapshot contents violate the map's invariants.
    InvalidSnapshot(String),
    /// A submitted record carries a negative counter or histogram bucket, or
    /// a byte count too large for the signed sums.
    InvalidRecord { key: RecordKey, field: &'static str },
}

impl std::fmt::Display for PgMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgMapError::VersionConflict { expected, found } => write!(
                f,
                "version conflict: map is at v{}, update built against v{}",
                expected, found
            ),
            PgMapError::StaleEpoch {
                node,
                stored,
                reported,
            } => write!(
                f,
                "stale report from node {}: epoch {} < stored epoch {}",
                node, reported, stored
            ),
            PgMapError::AmbiguousUpdate(key) => {
                write!(f, "ambiguous update: {} both upserted and removed", key)
            }
            PgMapError::EpochRegression { current, proposed } => write!(
                f,
                "epoch regression: map is at e{}, update proposes e{}",
                current, proposed
            ),
            PgMapError::InvalidSnapshot(msg) => write!(f, "invalid snapshot: {}", msg),
            PgMapError::InvalidRecord { key, field } => {
                write!(f, "invalid record for {}: {} out of range", key, field)
            }
        }
    }
}

impl std::error::Error for PgMapError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = PgMapError::VersionConflict {
            expected: 4,
            found: 3,
        };
        assert_eq!(
            e.to_string(),
            "version conflict: map is at v4, update built against v3"
        );

        let e = PgMapError::AmbiguousUpdate(RecordKey::Pg(PgId::new(2, 0x1f)));
        assert_eq!(e.to_string(), "ambiguous update: pg 2.1f both upserted and removed");

        let e = PgMapError::StaleEpoch {
            node: 7,
            stored: 10,
            reported: 9,
        };
        assert!(e.to_string().contains("node 7"));

        let e = PgMapError::InvalidRecord {
            key: RecordKey::Node(3),
            field: "total_bytes",
        };
        assert_eq!(
            e.to_string(),
            "invalid record for node 3: total_bytes out of range"
        );
    }
}
