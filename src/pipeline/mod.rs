use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analytics::{AnalyticsSink, AsyncWriteQueue};
use crate::buffer::{BatchBuffer, FlushResult};
use crate::config::Config;
use crate::health::HealthMetrics;
use crate::retention::RetentionScheduler;
use crate::store::PrimaryStore;
use crate::verify::ConsistencyVerifier;

/// Owns one buffer per backend plus the timers that drain them.
///
/// Producers obtain a buffer with [`Pipeline::buffer`] and feed it events;
/// everything else runs in background tasks started by [`Pipeline::start`]
/// and torn down by [`Pipeline::shutdown`], which drains every buffer one
/// last time.
pub struct Pipeline<S> {
    store: Arc<dyn PrimaryStore>,
    secondary: Option<Arc<S>>,
    queue: Option<AsyncWriteQueue>,
    buffers: DashMap<i64, Arc<BatchBuffer>>,
    retention: RetentionScheduler,
    metrics: Option<Arc<HealthMetrics>>,
    cfg: PipelineSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
struct PipelineSettings {
    flush_interval: Duration,
    shutdown_timeout: Duration,
    verify: crate::config::VerifyConfig,
}

impl<S: AnalyticsSink> Pipeline<S> {
    /// Builds the pipeline. With a secondary sink this spawns the analytics
    /// queue worker, so it must run inside a tokio runtime.
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        secondary: Option<Arc<S>>,
        cfg: &Config,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let queue = secondary
            .as_ref()
            .map(|sink| AsyncWriteQueue::start(Arc::clone(sink), &cfg.queue, metrics.clone()));

        let retention = RetentionScheduler::new(
            Arc::clone(&store),
            cfg.retention.clone(),
            metrics.clone(),
        );

        Self {
            store,
            secondary,
            queue,
            buffers: DashMap::new(),
            retention,
            metrics,
            cfg: PipelineSettings {
                flush_interval: cfg.flush.interval,
                shutdown_timeout: cfg.queue.shutdown_timeout,
                verify: cfg.verify.clone(),
            },
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Buffer for `backend_id`, created on first use.
    pub fn buffer(&self, backend_id: i64) -> Arc<BatchBuffer> {
        if let Some(buffer) = self.buffers.get(&backend_id) {
            return Arc::clone(buffer.value());
        }

        let buffer = self
            .buffers
            .entry(backend_id)
            .or_insert_with(|| {
                tracing::debug!(backend_id, "creating backend buffer");
                Arc::new(BatchBuffer::new(self.queue.clone(), self.metrics.clone()))
            });
        Arc::clone(buffer.value())
    }

    /// Drops the buffer for a removed backend after flushing it.
    pub async fn remove_backend(&self, backend_id: i64) -> Option<FlushResult> {
        let (_, buffer) = self.buffers.remove(&backend_id)?;
        self.flush_buffer(backend_id, buffer).await
    }

    pub fn store(&self) -> &Arc<dyn PrimaryStore> {
        &self.store
    }

    pub fn queue(&self) -> Option<&AsyncWriteQueue> {
        self.queue.as_ref()
    }

    pub fn retention(&self) -> &RetentionScheduler {
        &self.retention
    }

    /// Flushes every backend buffer once.
    pub async fn flush_all(&self) -> Vec<(i64, FlushResult)> {
        // Snapshot first; DashMap guards must not be held across awaits.
        let buffers: Vec<(i64, Arc<BatchBuffer>)> = self
            .buffers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut results = Vec::with_capacity(buffers.len());
        for (backend_id, buffer) in buffers {
            if let Some(result) = self.flush_buffer(backend_id, buffer).await {
                results.push((backend_id, result));
            }
        }
        results
    }

    async fn flush_buffer(&self, backend_id: i64, buffer: Arc<BatchBuffer>) -> Option<FlushResult> {
        if !buffer.has_pending() {
            return None;
        }

        let store = Arc::clone(&self.store);
        let secondary_enabled = self.queue.is_some();
        match tokio::task::spawn_blocking(move || {
            buffer.flush(store.as_ref(), secondary_enabled, backend_id)
        })
        .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(backend_id, error = %e, "flush task panicked");
                None
            }
        }
    }

    /// Spawns the flush ticker, retention scheduler and, when an analytics
    /// sink is configured, the consistency verifier.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.flush_loop().await }));

        tasks.push(tokio::spawn(
            self.retention.clone().run(self.cancel.child_token()),
        ));

        if let Some(secondary) = &self.secondary {
            if self.cfg.verify.enabled {
                let verifier = ConsistencyVerifier::new(
                    Arc::clone(&self.store),
                    Arc::clone(secondary),
                    self.cfg.verify.clone(),
                    self.metrics.clone(),
                );
                tasks.push(tokio::spawn(verifier.run(self.cancel.child_token())));
            }
        }

        tracing::info!(
            flush_interval = ?self.cfg.flush_interval,
            analytics = self.secondary.is_some(),
            verify = self.secondary.is_some() && self.cfg.verify.enabled,
            "pipeline started",
        );
    }

    async fn flush_loop(&self) {
        let mut interval = tokio::time::interval(self.cfg.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {
                    self.flush_all().await;
                }
            }
        }
    }

    /// Stops background tasks, drains every buffer and waits (bounded) for
    /// the analytics queue to empty.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pipeline task ended abnormally");
            }
        }

        let results = self.flush_all().await;
        let retained = results
            .iter()
            .filter(|(_, r)| !r.traffic_ok || !r.country_ok)
            .count();
        if retained > 0 {
            tracing::warn!(
                backends = retained,
                "final flush left data in memory that will be lost",
            );
        }

        if let Some(queue) = &self.queue {
            queue.shutdown(self.cfg.shutdown_timeout).await;
        }

        tracing::info!(backends = self.buffers.len(), "pipeline stopped");
    }
}
