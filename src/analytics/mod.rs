pub mod clickhouse;
pub mod queue;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::buffer::record::{CountryRecord, TrafficRecord};
use crate::store::WindowSums;

pub use self::clickhouse::ClickHouseClient;
pub use self::queue::{AsyncWriteQueue, EnqueueOutcome, PendingQueueState, WriteTask};

/// Errors returned by analytics sink operations.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics request timed out after {0:?}")]
    Timeout(Duration),

    #[error("analytics server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("analytics transport error: {0}")]
    Transport(String),

    #[error("encoding analytics payload: {0}")]
    Encode(String),

    #[error("decoding analytics response: {0}")]
    Decode(String),
}

impl AnalyticsError {
    /// Short label used for metric dimensions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Status { .. } => "status",
            Self::Transport(_) => "transport",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
        }
    }
}

/// Metric category a batch is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Traffic,
    Country,
}

impl Category {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Traffic => "traffic",
            Self::Country => "country",
        }
    }
}

/// Analytics tables written by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalyticsTable {
    TrafficDetail,
    TrafficMinute,
    CountryMinute,
}

impl AnalyticsTable {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrafficDetail => "traffic_detail",
            Self::TrafficMinute => "traffic_minute",
            Self::CountryMinute => "country_minute",
        }
    }

    pub const fn category(self) -> Category {
        match self {
            Self::TrafficDetail | Self::TrafficMinute => Category::Traffic,
            Self::CountryMinute => Category::Country,
        }
    }
}

/// One row of the per-record detail table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficDetailRow {
    pub backend_id: i64,
    pub minute: String,
    pub domain: String,
    pub ip: String,
    pub chain: String,
    pub chains: String,
    pub rule: String,
    pub rule_payload: String,
    pub source_ip: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    pub last_seen_ms: Option<i64>,
}

/// Traffic pre-summed per backend and minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficMinuteRow {
    pub backend_id: i64,
    pub minute: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryRow {
    pub backend_id: i64,
    pub minute: String,
    pub country: String,
    pub country_name: String,
    pub continent: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

/// Rows bound for a single analytics table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowBatch {
    TrafficDetail(Vec<TrafficDetailRow>),
    TrafficMinute(Vec<TrafficMinuteRow>),
    CountryMinute(Vec<CountryRow>),
}

impl RowBatch {
    /// Detail rows, one per record.
    pub fn traffic_detail(backend_id: i64, records: &[TrafficRecord]) -> Self {
        let rows = records
            .iter()
            .map(|r| TrafficDetailRow {
                backend_id,
                minute: r.key.minute.to_string(),
                domain: r.key.domain.clone(),
                ip: r.key.ip.clone(),
                chain: r.key.chain.clone(),
                chains: r.key.chains_label(),
                rule: r.key.rule.clone(),
                rule_payload: r.key.rule_payload.clone(),
                source_ip: r.key.source_ip.clone(),
                upload: r.stats.upload,
                download: r.stats.download,
                connections: r.stats.events,
                last_seen_ms: r.stats.last_seen_ms,
            })
            .collect();
        Self::TrafficDetail(rows)
    }

    /// Rows summed per minute, ordered by minute.
    pub fn traffic_minute(backend_id: i64, records: &[TrafficRecord]) -> Self {
        let mut by_minute: BTreeMap<&str, TrafficMinuteRow> = BTreeMap::new();
        for r in records {
            let row = by_minute
                .entry(r.key.minute.as_str())
                .or_insert_with(|| TrafficMinuteRow {
                    backend_id,
                    minute: r.key.minute.to_string(),
                    upload: 0,
                    download: 0,
                    connections: 0,
                });
            row.upload = row.upload.saturating_add(r.stats.upload);
            row.download = row.download.saturating_add(r.stats.download);
            row.connections = row.connections.saturating_add(r.stats.events);
        }
        Self::TrafficMinute(by_minute.into_values().collect())
    }

    pub fn country_minute(backend_id: i64, records: &[CountryRecord]) -> Self {
        let rows = records
            .iter()
            .map(|r| CountryRow {
                backend_id,
                minute: r.minute.to_string(),
                country: r.geo.country.clone(),
                country_name: r.geo.country_name.clone(),
                continent: r.geo.continent.clone(),
                upload: r.upload,
                download: r.download,
                connections: r.events,
            })
            .collect();
        Self::CountryMinute(rows)
    }

    pub fn table(&self) -> AnalyticsTable {
        match self {
            Self::TrafficDetail(_) => AnalyticsTable::TrafficDetail,
            Self::TrafficMinute(_) => AnalyticsTable::TrafficMinute,
            Self::CountryMinute(_) => AnalyticsTable::CountryMinute,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::TrafficDetail(rows) => rows.len(),
            Self::TrafficMinute(rows) => rows.len(),
            Self::CountryMinute(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the rows as newline-delimited JSON.
    pub fn to_ndjson(&self) -> Result<Vec<u8>, AnalyticsError> {
        let mut buf = Vec::with_capacity(self.len() * 192);
        match self {
            Self::TrafficDetail(rows) => write_ndjson(&mut buf, rows)?,
            Self::TrafficMinute(rows) => write_ndjson(&mut buf, rows)?,
            Self::CountryMinute(rows) => write_ndjson(&mut buf, rows)?,
        }
        Ok(buf)
    }
}

fn write_ndjson<T: Serialize>(buf: &mut Vec<u8>, rows: &[T]) -> Result<(), AnalyticsError> {
    for row in rows {
        serde_json::to_writer(&mut *buf, row).map_err(|e| AnalyticsError::Encode(e.to_string()))?;
        buf.push(b'\n');
    }
    Ok(())
}

/// Secondary (analytics) sink.
///
/// Implementations must be cheap to share; the queue worker and the
/// consistency verifier hold the same instance.
pub trait AnalyticsSink: Send + Sync + 'static {
    /// Bulk-inserts one batch into its table.
    fn insert(&self, batch: &RowBatch) -> impl Future<Output = Result<(), AnalyticsError>> + Send;

    /// Sums per-minute traffic for `backend_id` over buckets in `[start, end)`.
    fn window_sums(
        &self,
        backend_id: i64,
        start: &str,
        end: &str,
    ) -> impl Future<Output = Result<WindowSums, AnalyticsError>> + Send;
}
