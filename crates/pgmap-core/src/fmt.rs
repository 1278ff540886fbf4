//! Formatting helpers for status reports.
//!
//! Functions that differ between table columns and verbose reports are
//! parameterized via [`FmtStyle`].

use chrono::{DateTime, Utc};

use crate::model::Timestamp;

/// Controls compact (table columns) vs verbose (report lines) output.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FmtStyle {
    /// Compact: no spaces, short suffixes ("1.5G", "3m5s")
    Compact,
    /// Detail: spaces, full suffixes ("1.5 GiB", "3m 5s")
    Detail,
}

// ---------------------------------------------------------------------------
// Style-parameterized functions
// ---------------------------------------------------------------------------

/// Format byte count as human-readable size.
///
/// Compact: `"1.5G"`, `"100.3M"`, `"50.0K"`, `"512B"`
/// Detail:  `"1.5 GiB"`, `"100.3 MiB"`, `"50.0 KiB"`, `"512 B"`
pub fn format_bytes(bytes: u64, style: FmtStyle) -> String {
    let (t, g, m, k, b) = match style {
        FmtStyle::Compact => ("T", "G", "M", "K", "B"),
        FmtStyle::Detail => (" TiB", " GiB", " MiB", " KiB", " B"),
    };
    let f = bytes as f64;
    if bytes >= 1 << 40 {
        format!("{:.1}{}", f / (1u64 << 40) as f64, t)
    } else if bytes >= 1 << 30 {
        format!("{:.1}{}", f / (1u64 << 30) as f64, g)
    } else if bytes >= 1 << 20 {
        format!("{:.1}{}", f / (1u64 << 20) as f64, m)
    } else if bytes >= 1 << 10 {
        format!("{:.1}{}", f / 1024.0, k)
    } else {
        format!("{}{}", bytes, b)
    }
}

/// Format duration in seconds as human-readable.
///
/// Compact: `"3m5s"` (no spaces, `"-"` for negative)
/// Detail:  `"3m 5s"` (with spaces, `"0s"` for `<= 0`)
pub fn format_duration(secs: i64, style: FmtStyle) -> String {
    if secs < 0 && style == FmtStyle::Compact {
        return "-".to_string();
    }
    if secs <= 0 && style == FmtStyle::Detail {
        return "0s".to_string();
    }
    let sep = match style {
        FmtStyle::Compact => "",
        FmtStyle::Detail => " ",
    };
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}{}s", secs / 60, sep, secs % 60)
    } else if secs < 86400 {
        format!("{}h{}{}m", secs / 3600, sep, (secs % 3600) / 60)
    } else {
        format!("{}d{}{}h", secs / 86400, sep, (secs % 86400) / 3600)
    }
}

/// Format bytes-per-second rate as human-readable.
///
/// Compact: `"1.5G/s"`, `"100.3M/s"`
/// Detail:  `"1.5 GiB/s"`, `"100.3 MiB/s"`
pub fn format_bytes_rate(rate: f64, style: FmtStyle) -> String {
    if rate < 1.0 {
        return "0".to_string();
    }
    let (g, m, k, b) = match style {
        FmtStyle::Compact => ("G/s", "M/s", "K/s", "B/s"),
        FmtStyle::Detail => (" GiB/s", " MiB/s", " KiB/s", " B/s"),
    };
    if rate >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1}{}", rate / (1024.0 * 1024.0 * 1024.0), g)
    } else if rate >= 1024.0 * 1024.0 {
        format!("{:.1}{}", rate / (1024.0 * 1024.0), m)
    } else if rate >= 1024.0 {
        format!("{:.1}{}", rate / 1024.0, k)
    } else {
        format!("{:.0}{}", rate, b)
    }
}

/// Format ops-per-second rate as human-readable.
///
/// Compact: always `"{:.0}/s"` for rates < 1000
/// Detail:  `"{:.0}/s"` for >= 10, `"{:.1}/s"` for < 10
pub fn format_rate(rate: f64, style: FmtStyle) -> String {
    if rate < 0.01 {
        return "0".to_string();
    }
    if rate >= 1_000_000.0 {
        format!("{:.1}M/s", rate / 1_000_000.0)
    } else if rate >= 1_000.0 {
        format!("{:.1}K/s", rate / 1_000.0)
    } else {
        match style {
            FmtStyle::Compact => format!("{:.0}/s", rate),
            FmtStyle::Detail if rate >= 10.0 => format!("{:.0}/s", rate),
            FmtStyle::Detail => format!("{:.1}/s", rate),
        }
    }
}

// ---------------------------------------------------------------------------
// Style-independent functions
// ---------------------------------------------------------------------------

/// Format a fill ratio as a percentage: `0.956` -> `"95.6%"`.
pub fn format_ratio(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Format a millisecond timestamp as UTC, or `"-"` for zero/invalid.
pub fn format_stamp(stamp: Timestamp) -> String {
    if stamp <= 0 {
        return "-".to_string();
    }
    match DateTime::<Utc>::from_timestamp_millis(stamp) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "-".to_string(),
    }
}

/// Format how long ago `stamp` was, measured against `now` (both in ms).
pub fn format_since(stamp: Timestamp, now: Timestamp) -> String {
    format_duration(now.saturating_sub(stamp) / 1000, FmtStyle::Detail)
}
