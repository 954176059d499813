use std::fmt;

use chrono::{DateTime, Utc};

use crate::event::TrafficEvent;

/// Separator used when a hop path is rendered as a single string.
pub const CHAIN_SEPARATOR: &str = " > ";

/// Label used as the initial rule when a connection has no hop path.
pub const DIRECT_RULE: &str = "DIRECT";

/// A timestamp truncated to the minute, rendered as `YYYY-MM-DDTHH:MM:00`.
///
/// The canonical form sorts lexicographically in time order, which the
/// primary store relies on for range deletes and window reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MinuteKey(String);

impl MinuteKey {
    /// Buckets an epoch-millisecond timestamp into its minute.
    pub fn from_millis(ts_ms: i64) -> Self {
        Self(format_bucket(ts_ms, false))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hour bucket containing this minute.
    pub fn hour(&self) -> HourKey {
        let prefix = self.0.get(..13).unwrap_or(&self.0);
        HourKey(format!("{prefix}:00:00"))
    }
}

impl fmt::Display for MinuteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A timestamp truncated to the hour, rendered as `YYYY-MM-DDTHH:00:00`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HourKey(String);

impl HourKey {
    pub fn from_millis(ts_ms: i64) -> Self {
        Self(format_bucket(ts_ms, true))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn format_bucket(ts_ms: i64, hour: bool) -> String {
    let dt = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_default();
    if hour {
        dt.format("%Y-%m-%dT%H:00:00").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:00").to_string()
    }
}

/// Formats an arbitrary instant in the same canonical form as bucket keys,
/// without truncation. Used for retention cutoffs and window bounds.
pub fn format_instant(ts_ms: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_default();
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Identity of one buffered traffic record.
///
/// Every field participates in equality; two events merge only when all of
/// them match. Fields are kept separate (never joined into one string) so
/// separator characters inside values cannot cause collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub backend_id: i64,
    pub minute: MinuteKey,
    pub domain: String,
    pub ip: String,
    pub chain: String,
    /// Hop path, outermost hop first.
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
    /// Source device IP, empty when unknown.
    pub source_ip: String,
}

impl AggregationKey {
    /// Derives the key for an event observed at `ts_ms`.
    pub fn from_event(backend_id: i64, event: &TrafficEvent, ts_ms: i64) -> Self {
        Self {
            backend_id,
            minute: MinuteKey::from_millis(ts_ms),
            domain: event.domain.clone(),
            ip: event.ip.clone(),
            chain: event.chain.clone(),
            chains: event.chains.clone(),
            rule: event.rule.clone(),
            rule_payload: event.rule_payload.clone(),
            source_ip: event.source_ip.clone().unwrap_or_default(),
        }
    }

    /// The first rule-group hop of the path: the last element, or
    /// [`DIRECT_RULE`] for connections without a path.
    pub fn initial_rule(&self) -> &str {
        self.chains
            .last()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(DIRECT_RULE)
    }

    /// Hop path joined with [`CHAIN_SEPARATOR`], as stored.
    pub fn chains_label(&self) -> String {
        self.chains.join(CHAIN_SEPARATOR)
    }
}
