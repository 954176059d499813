use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::analytics::AnalyticsSink;
use crate::buffer::key::format_instant;
use crate::config::VerifyConfig;
use crate::event::now_ms;
use crate::health::HealthMetrics;
use crate::store::{PrimaryStore, WindowSums};

/// Cross-sink comparison for one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub backend_id: i64,
    /// Inclusive window start.
    pub start: String,
    /// Exclusive window end.
    pub end: String,
    pub primary: WindowSums,
    pub secondary: WindowSums,
    pub upload_drift_pct: f64,
    pub download_drift_pct: f64,
}

/// Relative difference of `secondary` against `primary`, in percent.
pub fn drift_percent(primary: u64, secondary: u64) -> f64 {
    let base = (primary as f64).abs().max(1.0);
    (secondary as f64 - primary as f64) / base * 100.0
}

/// Compares trailing-window totals between the primary store and the
/// analytics sink.
///
/// Read-only: nothing is repaired, drift is only reported.
pub struct ConsistencyVerifier<S> {
    primary: Arc<dyn PrimaryStore>,
    secondary: Arc<S>,
    cfg: VerifyConfig,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: AnalyticsSink> ConsistencyVerifier<S> {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        secondary: Arc<S>,
        cfg: VerifyConfig,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            primary,
            secondary,
            cfg,
            metrics,
        }
    }

    /// Window `[end - window, end)` where `end` is the start of the minute
    /// containing `now_ms`. The still-filling minute is excluded.
    pub fn window_bounds(&self, now_ms: i64) -> (String, String) {
        let end_ms = now_ms - now_ms.rem_euclid(60_000);
        let window_ms = i64::try_from(self.cfg.window.as_millis()).unwrap_or(i64::MAX);
        let start_ms = end_ms.saturating_sub(window_ms);
        (format_instant(start_ms), format_instant(end_ms))
    }

    /// Runs one verification pass over every backend known to the primary
    /// store. Backends whose reads fail are logged and skipped.
    pub async fn run_once(&self) -> Result<Vec<DriftReport>> {
        let primary = Arc::clone(&self.primary);
        let backends = tokio::task::spawn_blocking(move || primary.list_backends())
            .await
            .context("joining backend listing")??;

        let (start, end) = self.window_bounds(now_ms());
        let mut reports = Vec::with_capacity(backends.len());

        for backend_id in backends {
            match self.verify_backend(backend_id, &start, &end).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.verify_errors.inc();
                    }
                    tracing::warn!(backend_id, error = %e, "consistency check failed");
                }
            }
        }

        Ok(reports)
    }

    async fn verify_backend(&self, backend_id: i64, start: &str, end: &str) -> Result<DriftReport> {
        let primary = {
            let store = Arc::clone(&self.primary);
            let (start, end) = (start.to_string(), end.to_string());
            tokio::task::spawn_blocking(move || store.read_window_sums(backend_id, &start, &end))
                .await
                .context("joining primary window read")?
                .context("reading primary window sums")?
        };

        let secondary = self
            .secondary
            .window_sums(backend_id, start, end)
            .await
            .context("reading analytics window sums")?;

        let report = DriftReport {
            backend_id,
            start: start.to_string(),
            end: end.to_string(),
            primary,
            secondary,
            upload_drift_pct: drift_percent(primary.upload, secondary.upload),
            download_drift_pct: drift_percent(primary.download, secondary.download),
        };

        if let Some(metrics) = &self.metrics {
            let backend = backend_id.to_string();
            metrics
                .drift_percent
                .with_label_values(&[&backend, "upload"])
                .set(report.upload_drift_pct);
            metrics
                .drift_percent
                .with_label_values(&[&backend, "download"])
                .set(report.download_drift_pct);
        }

        tracing::info!(
            backend_id,
            start = %report.start,
            end = %report.end,
            primary_upload = primary.upload,
            secondary_upload = secondary.upload,
            upload_delta = secondary.upload as i128 - primary.upload as i128,
            upload_drift = format_args!("{:.2}%", report.upload_drift_pct),
            primary_download = primary.download,
            secondary_download = secondary.download,
            download_delta = secondary.download as i128 - primary.download as i128,
            download_drift = format_args!("{:.2}%", report.download_drift_pct),
            "consistency check",
        );

        Ok(report)
    }

    /// Runs passes on a timer until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.cfg.enabled {
            tracing::info!("consistency verifier disabled");
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.cfg.start_delay) => {}
        }

        let mut interval = tokio::time::interval(self.cfg.interval.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "consistency verification pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::analytics::{AnalyticsError, RowBatch};
    use crate::buffer::BatchBuffer;
    use crate::event::TrafficEvent;
    use crate::store::SqliteStore;

    #[derive(Default)]
    struct FixedSink {
        sums: Mutex<HashMap<i64, WindowSums>>,
        failing: Vec<i64>,
        seen_windows: Mutex<Vec<(String, String)>>,
    }

    impl AnalyticsSink for FixedSink {
        async fn insert(&self, _batch: &RowBatch) -> Result<(), AnalyticsError> {
            Ok(())
        }

        async fn window_sums(
            &self,
            backend_id: i64,
            start: &str,
            end: &str,
        ) -> Result<WindowSums, AnalyticsError> {
            self.seen_windows
                .lock()
                .push((start.to_string(), end.to_string()));
            if self.failing.contains(&backend_id) {
                return Err(AnalyticsError::Transport("connection refused".to_string()));
            }
            Ok(self
                .sums
                .lock()
                .get(&backend_id)
                .copied()
                .unwrap_or_default())
        }
    }

    fn seed(store: &SqliteStore, backend_id: i64, upload: f64, download: f64) {
        // Two minutes ago, well inside the default window.
        let ts = now_ms() - 120_000;
        let buffer = BatchBuffer::new(None, None);
        buffer.add(
            backend_id,
            &TrafficEvent {
                domain: "a.com".to_string(),
                ip: "1.1.1.1".to_string(),
                upload,
                download,
                timestamp_ms: Some(ts),
                ..Default::default()
            },
        );
        assert!(buffer.flush(store, false, backend_id).traffic_ok);
    }

    fn verify_config() -> VerifyConfig {
        VerifyConfig {
            window: Duration::from_secs(10 * 60),
            ..Default::default()
        }
    }

    #[test]
    fn test_drift_percent() {
        assert_eq!(drift_percent(100, 110), 10.0);
        assert_eq!(drift_percent(100, 90), -10.0);
        assert_eq!(drift_percent(0, 0), 0.0);
        assert_eq!(drift_percent(0, 5), 500.0);
    }

    #[test]
    fn test_window_bounds_exclude_current_minute() {
        let store: Arc<dyn PrimaryStore> = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let verifier = ConsistencyVerifier::new(
            store,
            Arc::new(FixedSink::default()),
            verify_config(),
            None,
        );

        // 2023-11-14T22:13:20Z
        let (start, end) = verifier.window_bounds(1_700_000_000_000);
        assert_eq!(end, "2023-11-14T22:13:00");
        assert_eq!(start, "2023-11-14T22:03:00");
    }

    #[tokio::test]
    async fn test_reports_ten_percent_upload_drift() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        seed(&store, 1, 100.0, 200.0);

        let sink = Arc::new(FixedSink::default());
        sink.sums.lock().insert(
            1,
            WindowSums {
                upload: 110,
                download: 200,
            },
        );

        let metrics = Arc::new(HealthMetrics::new("").expect("metrics"));
        let verifier = ConsistencyVerifier::new(
            store,
            Arc::clone(&sink),
            verify_config(),
            Some(Arc::clone(&metrics)),
        );

        let reports = verifier.run_once().await.expect("run");
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.primary.upload, 100);
        assert_eq!(report.secondary.upload, 110);
        assert_eq!(format!("{:.2}", report.upload_drift_pct), "10.00");
        assert_eq!(report.download_drift_pct, 0.0);
        assert_eq!(
            metrics
                .drift_percent
                .with_label_values(&["1", "upload"])
                .get(),
            10.0
        );
    }

    #[tokio::test]
    async fn test_backend_failure_does_not_stop_others() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        seed(&store, 1, 10.0, 10.0);
        seed(&store, 2, 10.0, 10.0);

        let sink = Arc::new(FixedSink {
            failing: vec![1],
            ..Default::default()
        });
        let metrics = Arc::new(HealthMetrics::new("").expect("metrics"));
        let verifier = ConsistencyVerifier::new(
            store,
            Arc::clone(&sink),
            verify_config(),
            Some(Arc::clone(&metrics)),
        );

        let reports = verifier.run_once().await.expect("run");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].backend_id, 2);
        assert_eq!(reports[0].upload_drift_pct, -100.0);
        assert_eq!(metrics.verify_errors.get(), 1.0);

        // Every backend is checked against the same window.
        let windows = sink.seen_windows.lock();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], windows[1]);
    }

    #[tokio::test]
    async fn test_disabled_verifier_returns_immediately() {
        let store: Arc<dyn PrimaryStore> = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let verifier = ConsistencyVerifier::new(
            store,
            Arc::new(FixedSink::default()),
            VerifyConfig {
                enabled: false,
                ..Default::default()
            },
            None,
        );
        tokio::time::timeout(Duration::from_secs(1), verifier.run(CancellationToken::new()))
            .await
            .expect("disabled verifier should exit");
    }
}
