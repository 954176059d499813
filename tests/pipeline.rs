use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use trafficstats::analytics::{AnalyticsError, AnalyticsSink, RowBatch, TrafficMinuteRow};
use trafficstats::buffer::BatchBuffer;
use trafficstats::config::{Config, VerifyConfig};
use trafficstats::event::{now_ms, GeoAttributedEvent, GeoLocation, TrafficEvent};
use trafficstats::pipeline::Pipeline;
use trafficstats::retention::CleanupOutcome;
use trafficstats::store::{PrimaryStore, RetentionTable, SqliteStore, WindowSums};
use trafficstats::verify::ConsistencyVerifier;

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// In-memory stand-in for ClickHouse that keeps the per-minute rows it is
/// sent and answers window queries from them.
#[derive(Default)]
struct MirrorSink {
    minutes: Mutex<Vec<TrafficMinuteRow>>,
    inserts: Mutex<usize>,
    down: AtomicBool,
}

impl AnalyticsSink for MirrorSink {
    async fn insert(&self, batch: &RowBatch) -> Result<(), AnalyticsError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AnalyticsError::Transport("connection refused".to_string()));
        }
        *self.inserts.lock() += 1;
        if let RowBatch::TrafficMinute(rows) = batch {
            self.minutes.lock().extend(rows.iter().cloned());
        }
        Ok(())
    }

    async fn window_sums(
        &self,
        backend_id: i64,
        start: &str,
        end: &str,
    ) -> Result<WindowSums, AnalyticsError> {
        let minutes = self.minutes.lock();
        let mut sums = WindowSums::default();
        for row in minutes.iter().filter(|r| {
            r.backend_id == backend_id && r.minute.as_str() >= start && r.minute.as_str() < end
        }) {
            sums.upload += row.upload;
            sums.download += row.download;
        }
        Ok(sums)
    }
}

fn traffic(domain: &str, upload: f64, download: f64, ts_ms: i64) -> TrafficEvent {
    TrafficEvent {
        domain: domain.to_string(),
        ip: "93.184.216.34".to_string(),
        chain: "node-a".to_string(),
        chains: vec!["node-a".to_string(), "proxy".to_string()],
        rule: "Match".to_string(),
        upload,
        download,
        timestamp_ms: Some(ts_ms),
        ..Default::default()
    }
}

fn geo(country: &str, upload: f64, ts_ms: i64) -> GeoAttributedEvent {
    GeoAttributedEvent {
        ip: "93.184.216.34".to_string(),
        geo: Some(GeoLocation {
            country: country.to_string(),
            country_name: country.to_string(),
            continent: "NA".to_string(),
        }),
        upload,
        download: 0.0,
        timestamp_ms: Some(ts_ms),
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.flush.interval = Duration::from_secs(3600);
    cfg.verify.enabled = false;
    cfg
}

#[tokio::test]
async fn test_both_sinks_agree_after_shutdown() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
    let sink = Arc::new(MirrorSink::default());

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store) as Arc<dyn PrimaryStore>,
        Some(Arc::clone(&sink)),
        &test_config(),
        None,
    ));
    pipeline.start();

    let ts = now_ms() - 3 * MINUTE_MS;
    let buffer = pipeline.buffer(7);
    for _ in 0..3 {
        buffer.add(7, &traffic("example.com", 10.0, 20.0, ts));
    }
    buffer.add(7, &traffic("example.org", 5.0, 0.0, ts + MINUTE_MS));
    buffer.add_geo_result(geo("US", 15.0, ts));

    pipeline.shutdown().await;

    assert_eq!(
        store
            .row_count(RetentionTable::TrafficMinute)
            .expect("count minute rows"),
        2
    );
    assert_eq!(
        store
            .row_count(RetentionTable::CountryMinute)
            .expect("count country rows"),
        1
    );
    // detail + minute for traffic, one country batch
    assert_eq!(*sink.inserts.lock(), 3);

    let verifier = ConsistencyVerifier::new(
        Arc::clone(&store) as Arc<dyn PrimaryStore>,
        Arc::clone(&sink),
        VerifyConfig::default(),
        None,
    );
    let reports = verifier.run_once().await.expect("verify");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].backend_id, 7);
    assert_eq!(
        reports[0].primary,
        WindowSums {
            upload: 35,
            download: 60
        }
    );
    assert_eq!(reports[0].secondary, reports[0].primary);
    assert_eq!(reports[0].upload_drift_pct, 0.0);
    assert_eq!(reports[0].download_drift_pct, 0.0);
}

#[tokio::test]
async fn test_analytics_outage_shows_up_as_drift() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
    let sink = Arc::new(MirrorSink::default());

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store) as Arc<dyn PrimaryStore>,
        Some(Arc::clone(&sink)),
        &test_config(),
        None,
    ));

    let ts = now_ms() - 2 * MINUTE_MS;
    pipeline.buffer(1).add(1, &traffic("a.com", 100.0, 100.0, ts));
    pipeline.flush_all().await;

    // Let the queue worker deliver the first flush before the outage.
    tokio::time::timeout(Duration::from_secs(5), async {
        while *sink.inserts.lock() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first flush mirrored");

    sink.down.store(true, Ordering::SeqCst);
    pipeline.buffer(1).add(1, &traffic("b.com", 100.0, 100.0, ts));
    let results = pipeline.flush_all().await;
    assert!(results.iter().all(|(_, r)| r.traffic_ok));

    pipeline.shutdown().await;

    let queue = pipeline.queue().expect("queue");
    assert!(queue.totals().failures >= 2);

    let verifier = ConsistencyVerifier::new(
        Arc::clone(&store) as Arc<dyn PrimaryStore>,
        Arc::clone(&sink),
        VerifyConfig::default(),
        None,
    );
    let reports = verifier.run_once().await.expect("verify");
    assert_eq!(reports[0].primary.upload, 200);
    assert_eq!(reports[0].secondary.upload, 100);
    assert_eq!(reports[0].upload_drift_pct, -50.0);
}

#[test]
fn test_retention_prunes_minute_rows_and_keeps_hourly() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
    let now = now_ms();

    let buffer = BatchBuffer::new(None, None);
    buffer.add(1, &traffic("old.com", 1.0, 1.0, now - 8 * DAY_MS));
    buffer.add(1, &traffic("new.com", 1.0, 1.0, now - DAY_MS));
    buffer.add_geo_result(geo("DE", 1.0, now - 8 * DAY_MS));
    let result = buffer.flush(store.as_ref(), false, 1);
    assert!(result.traffic_ok && result.country_ok);

    let scheduler = trafficstats::retention::RetentionScheduler::new(
        Arc::clone(&store) as Arc<dyn PrimaryStore>,
        Config::default().retention,
        None,
    );

    let outcome = scheduler.run_at(now).expect("cleanup");
    let CleanupOutcome::Completed(report) = outcome else {
        panic!("cleanup was skipped");
    };
    assert_eq!(report.deleted.get("traffic_minute"), Some(&1));
    assert_eq!(report.deleted.get("country_minute"), Some(&1));
    assert_eq!(report.deleted.get("traffic_hourly"), Some(&0));

    assert_eq!(
        store
            .row_count(RetentionTable::TrafficMinute)
            .expect("count"),
        1
    );
    assert_eq!(
        store
            .row_count(RetentionTable::TrafficHourly)
            .expect("count"),
        2
    );
}
