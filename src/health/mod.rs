use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "trafficstats";

/// Prometheus metrics for the aggregation pipeline.
///
/// All metrics use the "trafficstats" namespace and live in a private
/// registry, so several instances can coexist in one process (tests).
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Buffer / primary sink ===
    /// Total buffer flush cycles.
    pub flushes: Counter,
    /// Primary write failures by kind (traffic/country).
    pub flush_failures: CounterVec,
    /// Records committed to the primary store by kind.
    pub records_written: CounterVec,
    /// Time spent in one buffer flush.
    pub flush_duration: Histogram,

    // === Analytics queue ===
    /// Batches waiting for the queue worker.
    pub queue_pending_batches: Gauge,
    /// Rows across all waiting batches.
    pub queue_pending_rows: Gauge,
    /// Batches written to the analytics sink by category.
    pub queue_batches: CounterVec,
    /// Rows written to the analytics sink by category.
    pub queue_rows: CounterVec,
    /// Failed analytics writes by category and error type.
    pub queue_failures: CounterVec,
    /// Batches rejected at enqueue by category.
    pub queue_dropped: CounterVec,
    /// Analytics insert duration by table.
    pub analytics_write_duration: HistogramVec,

    // === Verifier ===
    /// Latest relative drift in percent by backend and direction.
    pub drift_percent: GaugeVec,
    /// Backends skipped during verification because a read failed.
    pub verify_errors: Counter,

    // === Retention ===
    /// Rows deleted by the retention scheduler by table.
    pub retention_deleted_rows: CounterVec,
    /// Retention runs by outcome.
    pub retention_runs: CounterVec,
    /// Store compactions triggered by retention.
    pub compactions: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Total buffer flush cycles.").namespace(NAMESPACE),
        )?;
        let flush_failures = CounterVec::new(
            Opts::new(
                "flush_failures_total",
                "Total primary sink write failures by sink and kind.",
            )
            .namespace(NAMESPACE),
            &["sink", "kind"],
        )?;
        let records_written = CounterVec::new(
            Opts::new(
                "records_written_total",
                "Total records committed to the primary sink by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to flush one backend buffer.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let queue_pending_batches = Gauge::with_opts(
            Opts::new(
                "queue_pending_batches",
                "Batches waiting for the analytics queue worker.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_pending_rows = Gauge::with_opts(
            Opts::new(
                "queue_pending_rows",
                "Rows across all batches waiting for the analytics queue worker.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_batches = CounterVec::new(
            Opts::new(
                "queue_batches_total",
                "Total batches written to the analytics sink by category.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let queue_rows = CounterVec::new(
            Opts::new(
                "queue_rows_total",
                "Total rows written to the analytics sink by category.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let queue_failures = CounterVec::new(
            Opts::new(
                "queue_failures_total",
                "Total failed analytics writes by category and error type.",
            )
            .namespace(NAMESPACE),
            &["category", "error_type"],
        )?;
        let queue_dropped = CounterVec::new(
            Opts::new(
                "queue_dropped_total",
                "Total batches dropped by queue backpressure by category.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let analytics_write_duration = HistogramVec::new(
            HistogramOpts::new(
                "analytics_write_duration_seconds",
                "Time to insert a batch into the analytics sink by table.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["table"],
        )?;

        let drift_percent = GaugeVec::new(
            Opts::new(
                "drift_percent",
                "Relative analytics-vs-primary drift in percent by backend and direction.",
            )
            .namespace(NAMESPACE),
            &["backend", "direction"],
        )?;
        let verify_errors = Counter::with_opts(
            Opts::new(
                "verify_errors_total",
                "Total backends skipped during verification due to read errors.",
            )
            .namespace(NAMESPACE),
        )?;

        let retention_deleted_rows = CounterVec::new(
            Opts::new(
                "retention_deleted_rows_total",
                "Total rows deleted by retention by table.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let retention_runs = CounterVec::new(
            Opts::new("retention_runs_total", "Total retention runs by outcome.")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let compactions = Counter::with_opts(
            Opts::new(
                "compactions_total",
                "Total primary store compactions triggered by retention.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        registry.register(Box::new(queue_pending_batches.clone()))?;
        registry.register(Box::new(queue_pending_rows.clone()))?;
        registry.register(Box::new(queue_batches.clone()))?;
        registry.register(Box::new(queue_rows.clone()))?;
        registry.register(Box::new(queue_failures.clone()))?;
        registry.register(Box::new(queue_dropped.clone()))?;
        registry.register(Box::new(analytics_write_duration.clone()))?;

        registry.register(Box::new(drift_percent.clone()))?;
        registry.register(Box::new(verify_errors.clone()))?;

        registry.register(Box::new(retention_deleted_rows.clone()))?;
        registry.register(Box::new(retention_runs.clone()))?;
        registry.register(Box::new(compactions.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            flushes,
            flush_failures,
            records_written,
            flush_duration,
            queue_pending_batches,
            queue_pending_rows,
            queue_batches,
            queue_rows,
            queue_failures,
            queue_dropped,
            analytics_write_duration,
            drift_percent,
            verify_errors,
            retention_deleted_rows,
            retention_runs,
            compactions,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
