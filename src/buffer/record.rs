use std::collections::HashMap;

use crate::event::{clamp_bytes, GeoAttributedEvent, GeoLocation};

use super::key::{AggregationKey, MinuteKey};

/// Running totals for one [`AggregationKey`] within a flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferedRecord {
    pub upload: u64,
    pub download: u64,
    /// Latest event timestamp merged into this record, if any event carried one.
    pub last_seen_ms: Option<i64>,
    /// Number of events merged.
    pub events: u64,
}

impl BufferedRecord {
    /// Folds one event delta into the record.
    pub fn add(&mut self, upload: u64, download: u64, ts_ms: Option<i64>) {
        self.upload = self.upload.saturating_add(upload);
        self.download = self.download.saturating_add(download);
        self.events = self.events.saturating_add(1);
        self.last_seen_ms = max_timestamp(self.last_seen_ms, ts_ms);
    }

    /// Folds another record for the same key into this one.
    pub fn merge(&mut self, other: &BufferedRecord) {
        self.upload = self.upload.saturating_add(other.upload);
        self.download = self.download.saturating_add(other.download);
        self.events = self.events.saturating_add(other.events);
        self.last_seen_ms = max_timestamp(self.last_seen_ms, other.last_seen_ms);
    }

    /// The part of this record not already covered by `sent`.
    pub fn without(&self, sent: &BufferedRecord) -> BufferedRecord {
        BufferedRecord {
            upload: self.upload.saturating_sub(sent.upload),
            download: self.download.saturating_sub(sent.download),
            events: self.events.saturating_sub(sent.events),
            last_seen_ms: self.last_seen_ms,
        }
    }

    /// True when the record carries no bytes in either direction.
    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }
}

/// Missing timestamps compare as 0 but are never materialized as 0.
fn max_timestamp(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// One keyed record handed to a sink during a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub key: AggregationKey,
    pub stats: BufferedRecord,
}

/// Traffic grouped by destination country.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryRecord {
    pub minute: MinuteKey,
    pub geo: GeoLocation,
    pub upload: u64,
    pub download: u64,
    pub events: u64,
}

/// Groups geo-attributed events by location.
///
/// Events without a resolved location are dropped. Each group is bucketed at
/// the minute of its latest event timestamp, falling back to `now_ms` when no
/// event in the group carried one. Groups keep first-seen order.
pub fn group_by_country(events: &[GeoAttributedEvent], now_ms: i64) -> Vec<CountryRecord> {
    struct Group<'a> {
        geo: &'a GeoLocation,
        upload: u64,
        download: u64,
        events: u64,
        latest_ms: Option<i64>,
    }

    let mut index: HashMap<&GeoLocation, usize> = HashMap::new();
    let mut groups: Vec<Group<'_>> = Vec::new();

    for event in events {
        let Some(geo) = event.geo.as_ref() else {
            continue;
        };

        let idx = *index.entry(geo).or_insert_with(|| {
            groups.push(Group {
                geo,
                upload: 0,
                download: 0,
                events: 0,
                latest_ms: None,
            });
            groups.len() - 1
        });

        let group = &mut groups[idx];
        group.upload = group.upload.saturating_add(clamp_bytes(event.upload));
        group.download = group.download.saturating_add(clamp_bytes(event.download));
        group.events += 1;
        group.latest_ms = max_timestamp(group.latest_ms, event.timestamp_ms);
    }

    groups
        .into_iter()
        .map(|g| CountryRecord {
            minute: MinuteKey::from_millis(g.latest_ms.unwrap_or(now_ms)),
            geo: g.geo.clone(),
            upload: g.upload,
            download: g.download,
            events: g.events,
        })
        .collect()
}
