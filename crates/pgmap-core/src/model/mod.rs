//! Entity records and additive aggregates tracked by the map.
//!
//! - [`pg`]: placement-group identifiers, state bits and stat records
//! - [`node`]: storage-node stat records and op-queue-age histograms
//! - [`sum`]: additive sums over PG and node records
//!
//! # Accounting
//!
//! ```text
//! PgRecord ──add/sub──> PoolStatSum (per pool) ──> GlobalStatSum.pg
//! NodeRecord ─add/sub─> NodeStatSum ─────────────> GlobalStatSum.nodes
//! ```
//!
//! Every sum is kept equal to the field-wise sum over the records currently
//! present; replacing a record subtracts the old contribution before adding
//! the new one.

mod node;
mod pg;
mod sum;

/// Monotonic map version; one committed incremental per version.
pub type Version = u64;

/// Cluster-membership epoch.
pub type Epoch = u32;

/// Storage node identifier.
pub type NodeId = i32;

/// Pool identifier.
pub type PoolId = i64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

pub use node::{NodeRecord, Pow2Histogram};
pub use pg::{ParseStateError, PgId, PgRecord, PgState};
pub use sum::{GlobalStatSum, NodeStatSum, ObjectStatSum, PoolStatSum, RecoverySummary};
