pub mod key;
pub mod record;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::analytics::{AsyncWriteQueue, RowBatch, WriteTask};
use crate::event::{clamp_bytes, now_ms, GeoAttributedEvent, TrafficEvent};
use crate::health::HealthMetrics;
use crate::store::PrimaryStore;

use self::key::AggregationKey;
use self::record::{group_by_country, BufferedRecord, CountryRecord, TrafficRecord};

/// Minimum spacing between flush summary logs.
const LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Distinct non-empty domains seen this cycle, sorted.
    pub domains: Vec<String>,
    /// Distinct initial rules seen this cycle, sorted.
    pub rules: Vec<String>,
    /// False when the primary traffic write failed; the records were retained.
    pub traffic_ok: bool,
    /// False when the primary country write failed; the geo queue was retained.
    pub country_ok: bool,
    /// True iff either batch was non-empty before commit.
    pub has_updates: bool,
}

/// Rate limiter for the per-flush summary log.
pub struct LogGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns true at most once per interval. Calls in between are counted
    /// and can be collected with [`LogGate::take_suppressed`].
    pub fn should_log(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                false
            }
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Returns and resets the number of suppressed calls.
    pub fn take_suppressed(&self) -> u64 {
        self.suppressed.swap(0, Ordering::Relaxed)
    }
}

#[derive(Default)]
struct BufferState {
    records: HashMap<AggregationKey, BufferedRecord>,
    geo: Vec<GeoAttributedEvent>,
    /// Amounts of retained records already handed to the analytics queue.
    mirrored: HashMap<AggregationKey, BufferedRecord>,
    /// Length of the retained `geo` prefix already handed to the queue.
    geo_mirrored: usize,
}

/// In-memory merge buffer for one backend.
///
/// Producers call [`BatchBuffer::add`] and [`BatchBuffer::add_geo_result`]
/// from any thread; the pipeline calls [`BatchBuffer::flush`] periodically.
/// State is swapped out under the lock and committed outside it, so adds
/// never wait on storage I/O.
pub struct BatchBuffer {
    state: Mutex<BufferState>,
    queue: Option<AsyncWriteQueue>,
    metrics: Option<Arc<HealthMetrics>>,
    log_gate: LogGate,
    flushes: AtomicU64,
}

impl BatchBuffer {
    pub fn new(queue: Option<AsyncWriteQueue>, metrics: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            queue,
            metrics,
            log_gate: LogGate::new(LOG_INTERVAL),
            flushes: AtomicU64::new(0),
        }
    }

    /// Merges one traffic event into the buffer.
    pub fn add(&self, backend_id: i64, event: &TrafficEvent) {
        let ts = event.timestamp_ms.unwrap_or_else(now_ms);
        let key = AggregationKey::from_event(backend_id, event, ts);
        let upload = clamp_bytes(event.upload);
        let download = clamp_bytes(event.download);

        self.state
            .lock()
            .records
            .entry(key)
            .or_default()
            .add(upload, download, event.timestamp_ms);
    }

    /// Queues a geo-attributed event for the next flush.
    pub fn add_geo_result(&self, event: GeoAttributedEvent) {
        self.state.lock().geo.push(event);
    }

    /// Number of distinct buffered traffic records.
    pub fn size(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Number of queued geo events.
    pub fn pending_geo(&self) -> usize {
        self.state.lock().geo.len()
    }

    pub fn has_pending(&self) -> bool {
        let state = self.state.lock();
        !state.records.is_empty() || !state.geo.is_empty()
    }

    /// Commits buffered data to the primary store and mirrors it to the
    /// analytics queue.
    ///
    /// Never fails. A failed primary write keeps the affected data in the
    /// buffer for the next cycle and is reported through the `*_ok` flags.
    /// The queue receives every batch whatever the primary outcome; data
    /// retained after a failure is not mirrored a second time on retry.
    pub fn flush(
        &self,
        primary: &dyn PrimaryStore,
        secondary_enabled: bool,
        backend_id: i64,
    ) -> FlushResult {
        let (records, geo, mirrored, geo_mirrored) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.records),
                std::mem::take(&mut state.geo),
                std::mem::take(&mut state.mirrored),
                std::mem::take(&mut state.geo_mirrored),
            )
        };

        let mut result = FlushResult {
            traffic_ok: true,
            country_ok: true,
            ..Default::default()
        };

        if records.is_empty() && geo.is_empty() {
            return result;
        }
        result.has_updates = true;

        let started = Instant::now();
        let flush_seq = self.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        let secondary = if secondary_enabled {
            self.queue.as_ref()
        } else {
            None
        };

        let mut domains = BTreeSet::new();
        let mut rules = BTreeSet::new();
        let mut live = Vec::with_capacity(records.len());
        for (key, stats) in records {
            if !key.domain.is_empty() {
                domains.insert(key.domain.clone());
            }
            rules.insert(key.initial_rule().to_string());
            if !stats.is_zero() {
                live.push(TrafficRecord { key, stats });
            }
        }
        result.domains = domains.into_iter().collect();
        result.rules = rules.into_iter().collect();

        let traffic_written = self.flush_traffic(primary, secondary, backend_id, live, mirrored);
        result.traffic_ok = traffic_written.is_some();

        let country_written =
            self.flush_country(primary, secondary, backend_id, geo, geo_mirrored);
        result.country_ok = country_written.is_some();

        if let Some(metrics) = &self.metrics {
            metrics.flushes.inc();
            metrics
                .flush_duration
                .observe(started.elapsed().as_secs_f64());
        }

        if self.log_gate.should_log() {
            tracing::info!(
                backend_id,
                flush_seq,
                traffic_rows = traffic_written.unwrap_or(0),
                country_rows = country_written.unwrap_or(0),
                domains = result.domains.len(),
                rules = result.rules.len(),
                traffic_ok = result.traffic_ok,
                country_ok = result.country_ok,
                suppressed = self.log_gate.take_suppressed(),
                elapsed = ?started.elapsed(),
                "buffer flushed",
            );
        }

        result
    }

    /// Returns the number of rows written, or `None` when the write failed.
    fn flush_traffic(
        &self,
        primary: &dyn PrimaryStore,
        secondary: Option<&AsyncWriteQueue>,
        backend_id: i64,
        live: Vec<TrafficRecord>,
        mirrored: HashMap<AggregationKey, BufferedRecord>,
    ) -> Option<usize> {
        if live.is_empty() {
            return Some(0);
        }

        let written = primary.write_traffic_batch(backend_id, &live);

        if let Some(queue) = secondary {
            let unsent: Vec<TrafficRecord> = live
                .iter()
                .filter_map(|record| {
                    let stats = match mirrored.get(&record.key) {
                        Some(sent) => record.stats.without(sent),
                        None => record.stats,
                    };
                    (!stats.is_zero()).then(|| TrafficRecord {
                        key: record.key.clone(),
                        stats,
                    })
                })
                .collect();

            if !unsent.is_empty() {
                queue.enqueue(WriteTask::new(
                    backend_id,
                    RowBatch::traffic_detail(backend_id, &unsent),
                ));
                queue.enqueue(WriteTask::new(
                    backend_id,
                    RowBatch::traffic_minute(backend_id, &unsent),
                ));
            }
        }

        match written {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .records_written
                        .with_label_values(&["traffic"])
                        .inc_by(live.len() as f64);
                }
                Some(live.len())
            }
            Err(e) => {
                tracing::error!(
                    backend_id,
                    records = live.len(),
                    mirrored = secondary.is_some(),
                    error = %e,
                    "primary traffic write failed, retaining records",
                );

                if let Some(metrics) = &self.metrics {
                    metrics
                        .flush_failures
                        .with_label_values(&["primary", "traffic"])
                        .inc();
                }

                let mut state = self.state.lock();
                if secondary.is_some() {
                    for record in &live {
                        state
                            .mirrored
                            .entry(record.key.clone())
                            .or_default()
                            .merge(&record.stats);
                    }
                } else {
                    for (key, sent) in mirrored {
                        state.mirrored.entry(key).or_default().merge(&sent);
                    }
                }
                for record in live {
                    state
                        .records
                        .entry(record.key)
                        .or_default()
                        .merge(&record.stats);
                }

                None
            }
        }
    }

    /// Returns the number of country rows written, or `None` when the write
    /// failed.
    fn flush_country(
        &self,
        primary: &dyn PrimaryStore,
        secondary: Option<&AsyncWriteQueue>,
        backend_id: i64,
        geo: Vec<GeoAttributedEvent>,
        geo_mirrored: usize,
    ) -> Option<usize> {
        if geo.is_empty() {
            return Some(0);
        }

        let now = now_ms();
        let groups: Vec<CountryRecord> = group_by_country(&geo, now);
        if groups.is_empty() {
            return Some(0);
        }

        let written = primary.write_country_batch(backend_id, &groups);

        if let Some(queue) = secondary {
            let unsent = if geo_mirrored == 0 {
                groups.clone()
            } else {
                group_by_country(&geo[geo_mirrored.min(geo.len())..], now)
            };
            if !unsent.is_empty() {
                queue.enqueue(WriteTask::new(
                    backend_id,
                    RowBatch::country_minute(backend_id, &unsent),
                ));
            }
        }

        match written {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .records_written
                        .with_label_values(&["country"])
                        .inc_by(groups.len() as f64);
                }
                Some(groups.len())
            }
            Err(e) => {
                tracing::error!(
                    backend_id,
                    events = geo.len(),
                    mirrored = secondary.is_some(),
                    error = %e,
                    "primary country write failed, retaining geo queue",
                );

                if let Some(metrics) = &self.metrics {
                    metrics
                        .flush_failures
                        .with_label_values(&["primary", "country"])
                        .inc();
                }

                // Failed events go back ahead of anything queued meanwhile.
                let mut state = self.state.lock();
                state.geo_mirrored = if secondary.is_some() {
                    geo.len()
                } else {
                    geo_mirrored
                };
                let newer = std::mem::replace(&mut state.geo, geo);
                state.geo.extend(newer);

                None
            }
        }
    }
}
