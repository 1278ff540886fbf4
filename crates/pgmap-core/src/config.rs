//! Tunables for the aggregate and their defaults.

/// Default ratio at which a node counts as full.
pub const DEFAULT_FULL_RATIO: f64 = 0.95;

/// Default ratio at which a node counts as near-full.
pub const DEFAULT_NEARFULL_RATIO: f64 = 0.85;

/// Default number of delta samples retained per pool and globally.
pub const DEFAULT_DELTA_WINDOW: usize = 6;

/// Default age (seconds) after which an unhealthy PG is reported as stuck.
pub const DEFAULT_STUCK_THRESHOLD_SECS: i64 = 300;

/// Configuration for a [`crate::PgMap`].
#[derive(Debug, Clone, PartialEq)]
pub struct MapConfig {
    /// used/capacity at or above which a node is full.
    pub full_ratio: f64,
    /// used/capacity at or above which a node is near-full.
    pub nearfull_ratio: f64,
    /// Retained delta samples per tracker. Clamped to at least 1.
    pub delta_window: usize,
    /// Stuck-PG age threshold in seconds.
    pub stuck_threshold_secs: i64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            full_ratio: DEFAULT_FULL_RATIO,
            nearfull_ratio: DEFAULT_NEARFULL_RATIO,
            delta_window: DEFAULT_DELTA_WINDOW,
            stuck_threshold_secs: DEFAULT_STUCK_THRESHOLD_SECS,
        }
    }
}

impl MapConfig {
    /// Creates a config with custom ratios and the default window/threshold.
    pub fn with_ratios(full_ratio: f64, nearfull_ratio: f64) -> Self {
        Self {
            full_ratio: normalize_ratio(full_ratio),
            nearfull_ratio: normalize_ratio(nearfull_ratio),
            ..Self::default()
        }
    }

    /// Stuck threshold in milliseconds, the unit of map timestamps.
    pub fn stuck_threshold_ms(&self) -> i64 {
        self.stuck_threshold_secs.saturating_mul(1000)
    }
}

/// Ratios above 1.0 are legacy percentages (95 -> 0.95).
pub fn normalize_ratio(ratio: f64) -> f64 {
    if ratio > 1.0 { ratio / 100.0 } else { ratio }
}
