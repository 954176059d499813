use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::health::HealthMetrics;

use super::{AnalyticsError, AnalyticsSink, Category, RowBatch};

/// One unit of work for the analytics worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTask {
    pub backend_id: i64,
    pub batch: RowBatch,
}

impl WriteTask {
    pub fn new(backend_id: i64, batch: RowBatch) -> Self {
        Self { backend_id, batch }
    }

    pub fn rows(&self) -> usize {
        self.batch.len()
    }

    pub fn category(&self) -> Category {
        self.batch.table().category()
    }
}

/// Result of handing a task to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Rejected by backpressure or because the queue is shut down.
    Dropped,
}

/// Snapshot of the queue's admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingQueueState {
    pub pending_batches: usize,
    pub pending_rows: usize,
    pub max_pending_batches: usize,
    pub max_pending_rows: usize,
}

impl PendingQueueState {
    fn admits(&self, rows: usize) -> bool {
        self.pending_batches < self.max_pending_batches
            && self.pending_rows.saturating_add(rows) <= self.max_pending_rows
    }
}

/// Throughput counters accumulated over a reporting window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub traffic_batches: u64,
    pub traffic_rows: u64,
    pub country_batches: u64,
    pub country_rows: u64,
    /// Failed, timed out or dropped tasks.
    pub failures: u64,
    pub dropped: u64,
}

impl QueueStats {
    fn record_success(&mut self, category: Category, rows: usize) {
        let rows = rows as u64;
        match category {
            Category::Traffic => {
                self.traffic_batches += 1;
                self.traffic_rows += rows;
            }
            Category::Country => {
                self.country_batches += 1;
                self.country_rows += rows;
            }
        }
    }
}

struct MetricsWindow {
    current: QueueStats,
    totals: QueueStats,
    started: Instant,
}

impl MetricsWindow {
    fn new() -> Self {
        Self {
            current: QueueStats::default(),
            totals: QueueStats::default(),
            started: Instant::now(),
        }
    }

    fn update(&mut self, f: impl Fn(&mut QueueStats)) {
        f(&mut self.current);
        f(&mut self.totals);
    }
}

struct Shared {
    state: Mutex<PendingQueueState>,
    window: Mutex<MetricsWindow>,
    metrics_interval: Duration,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Serializes analytics writes through a single worker.
///
/// Cloning is cheap; every clone feeds the same FIFO channel and shares the
/// same admission counters. Admission is bounded by pending batch and row
/// ceilings so a slow analytics sink costs dropped batches instead of
/// unbounded memory.
#[derive(Clone)]
pub struct AsyncWriteQueue {
    tx: mpsc::UnboundedSender<WriteTask>,
    shared: Arc<Shared>,
}

impl AsyncWriteQueue {
    /// Spawns the worker and returns the queue handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S: AnalyticsSink>(
        sink: Arc<S>,
        cfg: &QueueConfig,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state: Mutex::new(PendingQueueState {
                pending_batches: 0,
                pending_rows: 0,
                max_pending_batches: cfg.max_pending_batches,
                max_pending_rows: cfg.max_pending_rows,
            }),
            window: Mutex::new(MetricsWindow::new()),
            metrics_interval: cfg.metrics_interval,
            metrics,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(run_worker(
            sink,
            rx,
            Arc::clone(&shared),
            cfg.task_timeout,
        ));
        *shared.worker.lock() = Some(handle);

        tracing::info!(
            max_pending_batches = cfg.max_pending_batches,
            max_pending_rows = cfg.max_pending_rows,
            task_timeout = ?cfg.task_timeout,
            "analytics write queue started",
        );

        Self { tx, shared }
    }

    /// Admits a task or drops it when a ceiling would be exceeded.
    ///
    /// Never blocks. Empty batches are accepted and skipped without
    /// touching the counters.
    pub fn enqueue(&self, task: WriteTask) -> EnqueueOutcome {
        if task.batch.is_empty() {
            return EnqueueOutcome::Queued;
        }

        let rows = task.rows();
        let category = task.category();

        if self.shared.cancel.is_cancelled() {
            self.record_drop(category, rows, "queue closed");
            return EnqueueOutcome::Dropped;
        }

        let snapshot = {
            let mut state = self.shared.state.lock();
            if !state.admits(rows) {
                let snapshot = *state;
                drop(state);
                tracing::warn!(
                    backend_id = task.backend_id,
                    table = task.batch.table().as_str(),
                    rows,
                    pending_batches = snapshot.pending_batches,
                    pending_rows = snapshot.pending_rows,
                    "analytics queue full, dropping batch",
                );
                self.record_drop(category, rows, "backpressure");
                return EnqueueOutcome::Dropped;
            }
            state.pending_batches += 1;
            state.pending_rows += rows;
            *state
        };

        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            // Worker is gone; undo the admission.
            settle(&self.shared, task.rows());
            self.record_drop(category, rows, "worker stopped");
            return EnqueueOutcome::Dropped;
        }

        self.publish_pending(snapshot);

        EnqueueOutcome::Queued
    }

    /// Current admission counters.
    pub fn snapshot(&self) -> PendingQueueState {
        *self.shared.state.lock()
    }

    /// Counters accumulated since the queue started.
    pub fn totals(&self) -> QueueStats {
        self.shared.window.lock().totals
    }

    /// Stops admitting new tasks and waits up to `timeout` for the worker
    /// to drain what is already queued.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shared.cancel.cancel();

        let Some(handle) = self.shared.worker.lock().take() else {
            return;
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                let state = self.snapshot();
                tracing::info!(
                    pending_batches = state.pending_batches,
                    "analytics write queue drained",
                );
            }
            Ok(Err(e)) => tracing::error!(error = %e, "analytics queue worker panicked"),
            Err(_) => {
                let state = self.snapshot();
                tracing::warn!(
                    pending_batches = state.pending_batches,
                    pending_rows = state.pending_rows,
                    "analytics queue drain timed out, abandoning pending batches",
                );
            }
        }
    }

    fn record_drop(&self, category: Category, rows: usize, reason: &'static str) {
        self.shared.window.lock().update(|s| {
            s.dropped += 1;
            s.failures += 1;
        });

        if let Some(metrics) = &self.shared.metrics {
            metrics
                .queue_dropped
                .with_label_values(&[category.as_str()])
                .inc();
            metrics
                .queue_failures
                .with_label_values(&[category.as_str(), "dropped"])
                .inc();
        }

        tracing::debug!(category = category.as_str(), rows, reason, "analytics batch dropped");
    }

    fn publish_pending(&self, state: PendingQueueState) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.queue_pending_batches.set(state.pending_batches as f64);
            metrics.queue_pending_rows.set(state.pending_rows as f64);
        }
    }
}

/// Releases the admission held by a task.
fn settle(shared: &Shared, rows: usize) -> PendingQueueState {
    let mut state = shared.state.lock();
    state.pending_batches = state.pending_batches.saturating_sub(1);
    state.pending_rows = state.pending_rows.saturating_sub(rows);
    *state
}

async fn run_worker<S: AnalyticsSink>(
    sink: Arc<S>,
    mut rx: mpsc::UnboundedReceiver<WriteTask>,
    shared: Arc<Shared>,
    task_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;

            task = rx.recv() => {
                match task {
                    Some(task) => process(&*sink, &shared, task, task_timeout).await,
                    None => return,
                }
            }

            _ = shared.cancel.cancelled() => {
                rx.close();
                while let Some(task) = rx.recv().await {
                    process(&*sink, &shared, task, task_timeout).await;
                }
                return;
            }
        }
    }
}

async fn process<S: AnalyticsSink>(
    sink: &S,
    shared: &Shared,
    task: WriteTask,
    task_timeout: Duration,
) {
    let rows = task.rows();
    let category = task.category();
    let table = task.batch.table();
    let started = Instant::now();

    let result = match tokio::time::timeout(task_timeout, sink.insert(&task.batch)).await {
        Ok(result) => result,
        Err(_) => Err(AnalyticsError::Timeout(task_timeout)),
    };

    let state = settle(shared, rows);

    if let Some(metrics) = &shared.metrics {
        metrics.queue_pending_batches.set(state.pending_batches as f64);
        metrics.queue_pending_rows.set(state.pending_rows as f64);
        metrics
            .analytics_write_duration
            .with_label_values(&[table.as_str()])
            .observe(started.elapsed().as_secs_f64());
    }

    match &result {
        Ok(()) => {
            shared
                .window
                .lock()
                .update(|s| s.record_success(category, rows));

            if let Some(metrics) = &shared.metrics {
                metrics
                    .queue_batches
                    .with_label_values(&[category.as_str()])
                    .inc();
                metrics
                    .queue_rows
                    .with_label_values(&[category.as_str()])
                    .inc_by(rows as f64);
            }

            tracing::debug!(
                backend_id = task.backend_id,
                table = table.as_str(),
                rows,
                "analytics batch written",
            );
        }
        Err(e) => {
            shared.window.lock().update(|s| s.failures += 1);

            if let Some(metrics) = &shared.metrics {
                metrics
                    .queue_failures
                    .with_label_values(&[category.as_str(), e.kind()])
                    .inc();
            }

            tracing::error!(
                backend_id = task.backend_id,
                table = table.as_str(),
                rows,
                error = %e,
                "analytics batch write failed",
            );
        }
    }

    maybe_emit_window(shared, state);
}

fn maybe_emit_window(shared: &Shared, state: PendingQueueState) {
    let mut window = shared.window.lock();
    if window.started.elapsed() < shared.metrics_interval {
        return;
    }

    let stats = std::mem::take(&mut window.current);
    let elapsed = window.started.elapsed();
    window.started = Instant::now();
    drop(window);

    tracing::info!(
        window = ?elapsed,
        traffic_batches = stats.traffic_batches,
        traffic_rows = stats.traffic_rows,
        country_batches = stats.country_batches,
        country_rows = stats.country_rows,
        failures = stats.failures,
        dropped = stats.dropped,
        pending_batches = state.pending_batches,
        pending_rows = state.pending_rows,
        "analytics queue summary",
    );
}
