use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::key::format_instant;
use crate::config::RetentionTuning;
use crate::event::now_ms;
use crate::health::HealthMetrics;
use crate::store::{PrimaryStore, RetentionConfig, RetentionTable};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn cleanup_interval(cfg: &RetentionConfig) -> Duration {
    Duration::from_secs(u64::from(cfg.cleanup_interval_hours.max(1)) * 3600)
}

/// Result of one cleanup invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Completed(CleanupReport),
    /// Another run was in progress.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Rows deleted per table.
    pub deleted: BTreeMap<&'static str, usize>,
    /// Cutoff used for the per-minute tables.
    pub connection_logs_cutoff: String,
    /// Cutoff used for the hourly table.
    pub hourly_stats_cutoff: String,
    pub compacted: bool,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> usize {
        self.deleted.values().sum()
    }
}

/// Cutoffs for a policy evaluated at `now_ms`.
pub fn cutoffs(cfg: &RetentionConfig, now_ms: i64) -> (String, String) {
    let cfg = cfg.normalized();
    let logs = now_ms - i64::from(cfg.connection_logs_days) * DAY_MS;
    let hourly = now_ms - i64::from(cfg.hourly_stats_days) * DAY_MS;
    (format_instant(logs), format_instant(hourly))
}

struct Inner {
    store: Arc<dyn PrimaryStore>,
    tuning: RetentionTuning,
    metrics: Option<Arc<HealthMetrics>>,
    running: AtomicBool,
    reschedule: Notify,
}

/// Deletes aged primary-store rows on a timer.
///
/// The policy is re-read from the store on every run, so operator changes
/// take effect without a restart. Cloning shares the same scheduler.
#[derive(Clone)]
pub struct RetentionScheduler {
    inner: Arc<Inner>,
}

/// Clears the in-progress flag when a run ends, including on panic.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetentionScheduler {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        tuning: RetentionTuning,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tuning,
                metrics,
                running: AtomicBool::new(false),
                reschedule: Notify::new(),
            }),
        }
    }

    /// Runs one cleanup pass now, unless one is already running.
    ///
    /// Blocking: call from a blocking context.
    pub fn run_now(&self) -> Result<CleanupOutcome> {
        self.run_at(now_ms())
    }

    /// Runs one cleanup pass as if the current time were `now_ms`.
    pub fn run_at(&self, now_ms: i64) -> Result<CleanupOutcome> {
        let inner = &self.inner;

        if inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("retention run already in progress, skipping");
            self.count_run("skipped");
            return Ok(CleanupOutcome::Skipped);
        }
        let _guard = RunGuard(&inner.running);

        match self.cleanup(now_ms) {
            Ok(report) => {
                self.count_run("completed");
                Ok(CleanupOutcome::Completed(report))
            }
            Err(e) => {
                self.count_run("failed");
                Err(e)
            }
        }
    }

    fn cleanup(&self, now_ms: i64) -> Result<CleanupReport> {
        let inner = &self.inner;
        let cfg = inner
            .store
            .retention_config()
            .context("reading retention config")?;
        let (logs_cutoff, hourly_cutoff) = cutoffs(&cfg, now_ms);

        let mut report = CleanupReport {
            connection_logs_cutoff: logs_cutoff,
            hourly_stats_cutoff: hourly_cutoff,
            ..Default::default()
        };

        for table in RetentionTable::ALL {
            let cutoff = if table.is_hourly() {
                &report.hourly_stats_cutoff
            } else {
                &report.connection_logs_cutoff
            };
            let deleted = inner
                .store
                .delete_rows_older_than(table, cutoff)
                .with_context(|| format!("pruning {}", table.as_str()))?;

            if let Some(metrics) = &inner.metrics {
                metrics
                    .retention_deleted_rows
                    .with_label_values(&[table.as_str()])
                    .inc_by(deleted as f64);
            }
            report.deleted.insert(table.as_str(), deleted);
        }

        let total = report.total_deleted();
        if total > inner.tuning.compaction_threshold {
            inner.store.compact().context("compacting primary store")?;
            report.compacted = true;
            if let Some(metrics) = &inner.metrics {
                metrics.compactions.inc();
            }
        }

        tracing::info!(
            connection_logs_days = cfg.connection_logs_days,
            hourly_stats_days = cfg.hourly_stats_days,
            deleted = ?report.deleted,
            total,
            compacted = report.compacted,
            "retention cleanup finished",
        );

        Ok(report)
    }

    /// Restarts the timer so a changed interval or enable flag applies to
    /// the next scheduled run.
    pub fn reschedule(&self) {
        self.inner.reschedule.notify_one();
    }

    /// Stores a new policy and restarts the timer.
    pub fn update_policy(&self, cfg: &RetentionConfig) -> Result<()> {
        self.inner
            .store
            .set_retention_config(cfg)
            .context("saving retention config")?;
        tracing::info!(
            connection_logs_days = cfg.connection_logs_days,
            hourly_stats_days = cfg.hourly_stats_days,
            auto_cleanup = cfg.auto_cleanup,
            cleanup_interval_hours = cfg.cleanup_interval_hours,
            "retention policy updated",
        );
        self.reschedule();
        Ok(())
    }

    async fn load_policy(&self) -> Option<RetentionConfig> {
        let store = Arc::clone(&self.inner.store);
        match tokio::task::spawn_blocking(move || store.retention_config()).await {
            Ok(Ok(cfg)) => Some(cfg),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "reading retention config for schedule");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "retention config task failed");
                None
            }
        }
    }

    /// Drives scheduled runs until `cancel` fires.
    ///
    /// The stored policy is re-read on every wake-up and at least every
    /// `tick_floor`. A changed interval or enable flag restarts the timer,
    /// and a run never fires once auto cleanup has been turned off.
    pub async fn run(self, cancel: CancellationToken) {
        let floor = self.inner.tuning.tick_floor;
        // Interval in force and the instant its countdown started.
        let mut timer: Option<(Duration, Instant)> = None;

        loop {
            let interval = match self.load_policy().await {
                Some(cfg) if cfg.auto_cleanup => Some(cleanup_interval(&cfg)),
                Some(_) => None,
                // Unreadable policy: keep whatever timer is running.
                None => timer.map(|(interval, _)| interval),
            };

            let now = Instant::now();
            timer = match (interval, timer) {
                (None, previous) => {
                    if previous.is_some() {
                        tracing::info!("retention auto cleanup disabled");
                    }
                    None
                }
                (Some(interval), Some((current, started))) if current == interval => {
                    Some((current, started))
                }
                (Some(interval), _) => {
                    tracing::info!(interval = ?interval, "retention timer started");
                    Some((interval, now))
                }
            };

            let wait = match timer {
                Some((interval, started)) => {
                    let due = started + interval;
                    if due <= now {
                        self.run_scheduled().await;
                        timer = Some((interval, Instant::now()));
                        continue;
                    }
                    (due - now).min(floor)
                }
                None => floor,
            };

            tracing::debug!(wait = ?wait, enabled = timer.is_some(), "retention scheduler sleeping");

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.inner.reschedule.notified() => {
                    tracing::info!("retention schedule reloaded");
                    timer = None;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn run_scheduled(&self) {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.run_now()).await {
            Ok(Ok(CleanupOutcome::Skipped)) => {
                tracing::debug!("scheduled retention run skipped");
            }
            Ok(Ok(CleanupOutcome::Completed(_))) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "retention cleanup failed"),
            Err(e) => tracing::error!(error = %e, "retention cleanup task panicked"),
        }
    }

    fn count_run(&self, outcome: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.retention_runs.with_label_values(&[outcome]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use anyhow::Result;

    use super::*;
    use crate::buffer::key::AggregationKey;
    use crate::buffer::record::{BufferedRecord, CountryRecord, TrafficRecord};
    use crate::event::TrafficEvent;
    use crate::store::{SqliteStore, WindowSums};

    const NOW: i64 = 1_700_000_000_000;
    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn record(domain: &str, ts: i64) -> TrafficRecord {
        let event = TrafficEvent {
            domain: domain.to_string(),
            ip: "1.1.1.1".to_string(),
            ..Default::default()
        };
        let mut stats = BufferedRecord::default();
        stats.add(1, 1, Some(ts));
        TrafficRecord {
            key: AggregationKey::from_event(1, &event, ts),
            stats,
        }
    }

    fn scheduler(store: Arc<SqliteStore>, threshold: usize) -> RetentionScheduler {
        RetentionScheduler::new(
            store,
            RetentionTuning {
                compaction_threshold: threshold,
                ..Default::default()
            },
            None,
        )
    }

    fn completed(outcome: CleanupOutcome) -> CleanupReport {
        match outcome {
            CleanupOutcome::Completed(report) => report,
            CleanupOutcome::Skipped => panic!("run was skipped"),
        }
    }

    #[test]
    fn test_cutoffs_clamp_to_one_day() {
        let cfg = RetentionConfig {
            connection_logs_days: 0,
            hourly_stats_days: 30,
            ..Default::default()
        };
        let (logs, hourly) = cutoffs(&cfg, NOW);
        assert_eq!(logs, format_instant(NOW - DAY_MS));
        assert_eq!(hourly, format_instant(NOW - 30 * DAY_MS));
    }

    #[test]
    fn test_seven_day_boundary() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        store
            .write_traffic_batch(
                1,
                &[
                    record("old.com", NOW - 7 * DAY_MS - HOUR_MS),
                    record("recent.com", NOW - 6 * DAY_MS - 23 * HOUR_MS),
                ],
            )
            .expect("seed");

        let report = completed(scheduler(Arc::clone(&store), 100_000).run_at(NOW).expect("run"));

        assert_eq!(report.deleted["traffic_minute"], 1);
        // Hourly rows follow the 30 day policy and survive.
        assert_eq!(report.deleted["traffic_hourly"], 0);
        assert_eq!(report.deleted["country_minute"], 0);
        assert!(!report.compacted);
        assert_eq!(store.row_count(RetentionTable::TrafficMinute).unwrap(), 1);
        assert_eq!(store.row_count(RetentionTable::TrafficHourly).unwrap(), 2);
    }

    #[test]
    fn test_policy_is_read_fresh_each_run() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let scheduler = scheduler(Arc::clone(&store), 100_000);
        store
            .write_traffic_batch(1, &[record("a.com", NOW - 3 * DAY_MS)])
            .expect("seed");

        let report = completed(scheduler.run_at(NOW).expect("run"));
        assert_eq!(report.total_deleted(), 0);

        store
            .set_retention_config(&RetentionConfig {
                connection_logs_days: 2,
                hourly_stats_days: 2,
                ..Default::default()
            })
            .expect("save policy");

        let report = completed(scheduler.run_at(NOW).expect("run"));
        assert_eq!(report.deleted["traffic_minute"], 1);
        assert_eq!(report.deleted["traffic_hourly"], 1);
    }

    #[test]
    fn test_compaction_above_threshold() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let old = NOW - 40 * DAY_MS;
        store
            .write_traffic_batch(1, &[record("a.com", old), record("b.com", old)])
            .expect("seed");

        let report = completed(scheduler(Arc::clone(&store), 3).run_at(NOW).expect("run"));
        // 2 minute rows + 2 hourly rows.
        assert_eq!(report.total_deleted(), 4);
        assert!(report.compacted);
    }

    /// Store whose deletes park until released, to hold a run open.
    struct ParkedStore {
        inner: SqliteStore,
        entered: Barrier,
        release: Barrier,
    }

    impl PrimaryStore for ParkedStore {
        fn write_traffic_batch(&self, backend_id: i64, records: &[TrafficRecord]) -> Result<()> {
            self.inner.write_traffic_batch(backend_id, records)
        }

        fn write_country_batch(&self, backend_id: i64, records: &[CountryRecord]) -> Result<()> {
            self.inner.write_country_batch(backend_id, records)
        }

        fn delete_rows_older_than(&self, table: RetentionTable, cutoff: &str) -> Result<usize> {
            if table == RetentionTable::TrafficMinute {
                self.entered.wait();
                self.release.wait();
            }
            self.inner.delete_rows_older_than(table, cutoff)
        }

        fn read_window_sums(&self, backend_id: i64, start: &str, end: &str) -> Result<WindowSums> {
            self.inner.read_window_sums(backend_id, start, end)
        }

        fn compact(&self) -> Result<()> {
            self.inner.compact()
        }

        fn retention_config(&self) -> Result<RetentionConfig> {
            self.inner.retention_config()
        }

        fn set_retention_config(&self, cfg: &RetentionConfig) -> Result<()> {
            self.inner.set_retention_config(cfg)
        }

        fn list_backends(&self) -> Result<Vec<i64>> {
            self.inner.list_backends()
        }
    }

    #[test]
    fn test_concurrent_run_is_skipped() {
        let store = Arc::new(ParkedStore {
            inner: SqliteStore::open_in_memory().expect("store"),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let scheduler = RetentionScheduler::new(
            Arc::clone(&store) as Arc<dyn PrimaryStore>,
            RetentionTuning::default(),
            None,
        );

        let background = {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || scheduler.run_at(NOW))
        };

        store.entered.wait();
        assert_eq!(scheduler.run_at(NOW).expect("second run"), CleanupOutcome::Skipped);
        store.release.wait();

        let first = background.join().expect("join").expect("first run");
        assert!(matches!(first, CleanupOutcome::Completed(_)));

        // Guard is released once the first run ends; the next run parks
        // again, so release it from here.
        let again = {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || scheduler.run_at(NOW))
        };
        store.entered.wait();
        store.release.wait();
        assert!(matches!(
            again.join().expect("join").expect("run"),
            CleanupOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let scheduler = scheduler(store, 100_000);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(scheduler.clone().run(cancel.clone()));
        scheduler.reschedule();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler exits")
            .expect("join");
    }

    fn timed_scheduler(store: Arc<SqliteStore>) -> RetentionScheduler {
        RetentionScheduler::new(
            store,
            RetentionTuning {
                tick_floor: Duration::from_secs(10 * 60),
                ..Default::default()
            },
            None,
        )
    }

    fn minute_rows(store: &SqliteStore) -> usize {
        store
            .row_count(RetentionTable::TrafficMinute)
            .expect("row count")
    }

    async fn advance(minutes: u64) {
        tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_auto_cleanup_stops_scheduled_runs() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        store
            .write_traffic_batch(1, &[record("old.com", now_ms() - 40 * DAY_MS)])
            .expect("seed");
        let hourly = RetentionConfig {
            cleanup_interval_hours: 1,
            ..Default::default()
        };
        store.set_retention_config(&hourly).expect("policy");

        let scheduler = timed_scheduler(Arc::clone(&store));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(cancel.clone()));

        advance(1).await;
        scheduler
            .update_policy(&RetentionConfig {
                auto_cleanup: false,
                ..hourly
            })
            .expect("disable");

        // Well past the one hour interval that was running before.
        advance(120).await;
        assert_eq!(minute_rows(&store), 1);

        // Re-enabling starts a fresh countdown.
        scheduler.update_policy(&hourly).expect("enable");
        advance(50).await;
        assert_eq!(minute_rows(&store), 1);
        advance(20).await;
        assert_eq!(minute_rows(&store), 0);

        cancel.cancel();
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_restarts_timer() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        store
            .write_traffic_batch(1, &[record("old.com", now_ms() - 40 * DAY_MS)])
            .expect("seed");
        store
            .set_retention_config(&RetentionConfig {
                cleanup_interval_hours: 6,
                ..Default::default()
            })
            .expect("policy");

        let scheduler = timed_scheduler(Arc::clone(&store));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(cancel.clone()));

        // Written behind the scheduler's back, as another process would.
        advance(5).await;
        store
            .set_retention_config(&RetentionConfig {
                cleanup_interval_hours: 1,
                ..Default::default()
            })
            .expect("shorten interval");

        // Picked up at the 10 minute re-read, so the first run lands near
        // 1h10m rather than 1h or 6h.
        advance(60).await;
        assert_eq!(minute_rows(&store), 1);
        advance(10).await;
        assert_eq!(minute_rows(&store), 0);

        cancel.cancel();
        handle.await.expect("join");
    }
}
