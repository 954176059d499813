use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the trafficstats service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Primary (SQLite) sink configuration.
    #[serde(default)]
    pub primary: PrimaryConfig,

    /// Secondary (ClickHouse) analytics sink configuration.
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Analytics write queue limits.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Buffer flush configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Cross-sink consistency verification.
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Retention scheduler tuning. The policy itself lives in the primary store.
    #[serde(default)]
    pub retention: RetentionTuning,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Primary sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PrimaryConfig {
    /// SQLite database file. Default: "trafficstats.db".
    #[serde(default = "default_primary_path")]
    pub path: PathBuf,

    /// How long a writer waits on a locked database. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,
}

/// ClickHouse HTTP interface configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    /// Enable the analytics sink.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse host name. Default: "localhost".
    #[serde(default = "default_analytics_host")]
    pub host: String,

    /// ClickHouse HTTP port. Default: 8123.
    #[serde(default = "default_analytics_port")]
    pub port: u16,

    /// Target database. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username. Default: "default".
    #[serde(default = "default_username")]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Use https instead of http.
    #[serde(default)]
    pub secure: bool,

    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_analytics_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Request body compression (none, gzip, zstd, zlib). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Create the analytics tables on startup. Default: true.
    #[serde(default = "default_true")]
    pub create_tables: bool,
}

/// Analytics write queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Max batches waiting for the worker. Default: 50.
    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: usize,

    /// Max rows across all waiting batches. Default: 200000.
    #[serde(default = "default_max_pending_rows")]
    pub max_pending_rows: usize,

    /// How often the queue logs a throughput summary. Default: 60s.
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub metrics_interval: Duration,

    /// Upper bound on a single write task. Default: 60s.
    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub task_timeout: Duration,

    /// How long shutdown waits for queued tasks to drain. Default: 30s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Buffer flush configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Flush period for every backend buffer. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Consistency verifier configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Enable periodic verification. Only effective with analytics enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between runs. Default: 5m.
    #[serde(default = "default_verify_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Delay before the first run. Default: 1m.
    #[serde(default = "default_verify_start_delay", with = "humantime_serde")]
    pub start_delay: Duration,

    /// Trailing window compared on each run. Default: 10m.
    #[serde(default = "default_verify_window", with = "humantime_serde")]
    pub window: Duration,
}

/// Retention scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionTuning {
    /// Deleted-row count above which a run compacts the store. Default: 100000.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,

    /// Longest the scheduler sleeps before re-reading the stored policy,
    /// so edits made by another process are picked up. Default: 5m.
    #[serde(default = "default_tick_floor", with = "humantime_serde")]
    pub tick_floor: Duration,
}

/// Health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for /metrics and /healthz. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_primary_path() -> PathBuf {
    PathBuf::from("trafficstats.db")
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_analytics_host() -> String {
    "localhost".to_string()
}

fn default_analytics_port() -> u16 {
    8123
}

fn default_database() -> String {
    "default".to_string()
}

fn default_username() -> String {
    "default".to_string()
}

fn default_analytics_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_pending_batches() -> usize {
    50
}

fn default_max_pending_rows() -> usize {
    200_000
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_verify_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_verify_start_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_verify_window() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_compaction_threshold() -> usize {
    100_000
}

fn default_tick_floor() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            primary: PrimaryConfig::default(),
            analytics: AnalyticsConfig::default(),
            queue: QueueConfig::default(),
            flush: FlushConfig::default(),
            verify: VerifyConfig::default(),
            retention: RetentionTuning::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            path: default_primary_path(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_analytics_host(),
            port: default_analytics_port(),
            database: default_database(),
            username: default_username(),
            password: String::new(),
            secure: false,
            timeout: default_analytics_timeout(),
            compression: default_compression(),
            create_tables: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_batches: default_max_pending_batches(),
            max_pending_rows: default_max_pending_rows(),
            metrics_interval: default_metrics_interval(),
            task_timeout: default_task_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_verify_interval(),
            start_delay: default_verify_start_delay(),
            window: default_verify_window(),
        }
    }
}

impl Default for RetentionTuning {
    fn default() -> Self {
        Self {
            compaction_threshold: default_compaction_threshold(),
            tick_floor: default_tick_floor(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.primary.path.as_os_str().is_empty() {
            bail!("primary.path is required");
        }

        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        if self.queue.max_pending_batches == 0 {
            bail!("queue.max_pending_batches must be positive");
        }

        if self.queue.max_pending_rows == 0 {
            bail!("queue.max_pending_rows must be positive");
        }

        if self.queue.metrics_interval.is_zero() {
            bail!("queue.metrics_interval must be positive");
        }

        if self.queue.task_timeout.is_zero() {
            bail!("queue.task_timeout must be positive");
        }

        if self.analytics.enabled {
            if self.analytics.host.is_empty() {
                bail!("analytics.host is required when enabled");
            }

            if self.analytics.port == 0 {
                bail!("analytics.port must be positive when enabled");
            }

            if self.analytics.database.is_empty() {
                bail!("analytics.database is required when enabled");
            }

            if self.analytics.timeout.is_zero() {
                bail!("analytics.timeout must be positive when enabled");
            }

            match self.analytics.compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "" => {}
                compression => bail!("invalid compression type: {compression}"),
            }
        }

        if self.verify.enabled {
            if self.verify.interval.is_zero() {
                bail!("verify.interval must be positive");
            }

            if self.verify.window < Duration::from_secs(60) {
                bail!("verify.window must be at least 1m");
            }
        }

        if self.retention.tick_floor.is_zero() {
            bail!("retention.tick_floor must be positive");
        }

        Ok(())
    }
}

impl AnalyticsConfig {
    /// Base URL of the ClickHouse HTTP interface.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}/", self.host, self.port)
    }
}
