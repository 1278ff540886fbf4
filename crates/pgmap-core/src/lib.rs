//! pgmap-core: in-memory aggregate of placement-group and storage-node state.
//!
//! Provides:
//! - `model`: PG/node records, additive stat sums, state bit sets
//! - `incremental`: validated batches of proposed changes
//! - `map`: the aggregate itself, its update applier and queries
//! - `delta`: rolling delta windows and rate estimation
//! - `stuck`: stuck-PG classification
//! - `shared`: single-writer / multi-reader wrapper around the map
//! - `storage`: snapshot file persistence
//! - `config`: tunables and their defaults
//! - `fmt`: human-readable formatting for reports

pub mod config;
pub mod delta;
pub mod error;
pub mod fmt;
pub mod incremental;
pub mod map;
pub mod model;
pub mod shared;
pub mod storage;
pub mod stuck;

pub use config::MapConfig;
pub use error::{PgMapError, RecordKey};
pub use incremental::{Incremental, IncrementalBuilder};
pub use map::{ApplyOutcome, PgFilter, PgMap, PgMapSnapshot};
pub use shared::SharedPgMap;
