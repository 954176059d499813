pub mod sqlite;

use anyhow::Result;
use serde::Deserialize;

use crate::buffer::record::{CountryRecord, TrafficRecord};

pub use self::sqlite::SqliteStore;

/// Primary-sink tables subject to retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionTable {
    /// Per-minute traffic rows (connection logs).
    TrafficMinute,
    /// Per-minute country rows (connection logs).
    CountryMinute,
    /// Hourly traffic aggregates.
    TrafficHourly,
}

impl RetentionTable {
    pub const ALL: [RetentionTable; 3] = [
        RetentionTable::TrafficMinute,
        RetentionTable::CountryMinute,
        RetentionTable::TrafficHourly,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrafficMinute => "traffic_minute",
            Self::CountryMinute => "country_minute",
            Self::TrafficHourly => "traffic_hourly",
        }
    }

    /// Column holding the bucket timestamp.
    pub const fn time_column(self) -> &'static str {
        match self {
            Self::TrafficMinute | Self::CountryMinute => "minute",
            Self::TrafficHourly => "hour",
        }
    }

    /// Whether the table follows the hourly-aggregate retention tier.
    pub const fn is_hourly(self) -> bool {
        matches!(self, Self::TrafficHourly)
    }
}

/// Summed traffic over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct WindowSums {
    pub upload: u64,
    pub download: u64,
}

/// Operator-controlled retention policy, persisted in the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Days to keep per-minute rows.
    pub connection_logs_days: u32,
    /// Days to keep hourly aggregate rows.
    pub hourly_stats_days: u32,
    pub auto_cleanup: bool,
    pub cleanup_interval_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            connection_logs_days: 7,
            hourly_stats_days: 30,
            auto_cleanup: true,
            cleanup_interval_hours: 6,
        }
    }
}

impl RetentionConfig {
    /// Clamps every period to at least one unit.
    pub fn normalized(self) -> Self {
        Self {
            connection_logs_days: self.connection_logs_days.max(1),
            hourly_stats_days: self.hourly_stats_days.max(1),
            auto_cleanup: self.auto_cleanup,
            cleanup_interval_hours: self.cleanup_interval_hours.max(1),
        }
    }
}

/// The low-latency row store backing live dashboards.
///
/// Writes are sum-reducing: a record whose key already exists adds to the
/// stored totals instead of replacing them, so a batch retried after a
/// failed flush never double counts what was not committed.
pub trait PrimaryStore: Send + Sync {
    /// Upserts keyed traffic records for one backend.
    fn write_traffic_batch(&self, backend_id: i64, records: &[TrafficRecord]) -> Result<()>;

    /// Upserts per-country records for one backend.
    fn write_country_batch(&self, backend_id: i64, records: &[CountryRecord]) -> Result<()>;

    /// Deletes rows whose bucket is strictly older than `cutoff`.
    fn delete_rows_older_than(&self, table: RetentionTable, cutoff: &str) -> Result<usize>;

    /// Sums traffic for `backend_id` over buckets in `[start, end)`.
    fn read_window_sums(&self, backend_id: i64, start: &str, end: &str) -> Result<WindowSums>;

    /// Reclaims space freed by deletes.
    fn compact(&self) -> Result<()>;

    /// Reads the current retention policy. Never cached by callers.
    fn retention_config(&self) -> Result<RetentionConfig>;

    fn set_retention_config(&self, cfg: &RetentionConfig) -> Result<()>;

    /// Backends with at least one stored traffic row.
    fn list_backends(&self) -> Result<Vec<i64>>;
}
