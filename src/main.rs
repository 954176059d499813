use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use trafficstats::analytics::ClickHouseClient;
use trafficstats::config::Config;
use trafficstats::health::HealthMetrics;
use trafficstats::pipeline::Pipeline;
use trafficstats::retention::{CleanupOutcome, RetentionScheduler};
use trafficstats::store::{PrimaryStore, SqliteStore};
use trafficstats::verify::ConsistencyVerifier;

/// Proxy traffic statistics aggregator.
#[derive(Parser)]
#[command(name = "trafficstats", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregation service (default).
    Run,
    /// Run one retention cleanup pass and exit.
    Cleanup,
    /// Run one consistency verification pass and exit.
    Verify,
    /// Show or update the stored retention policy.
    Policy {
        /// Days to keep per-minute rows.
        #[arg(long)]
        connection_logs_days: Option<u32>,
        /// Days to keep hourly aggregates.
        #[arg(long)]
        hourly_stats_days: Option<u32>,
        /// Enable or disable scheduled cleanup.
        #[arg(long)]
        auto_cleanup: Option<bool>,
        /// Hours between scheduled cleanups.
        #[arg(long)]
        cleanup_interval_hours: Option<u32>,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("trafficstats {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // The command line wins over the config file when set explicitly.
    let level = if cli.log_level != "info" {
        cli.log_level.clone()
    } else {
        cfg.log_level.clone()
    };
    let filter =
        EnvFilter::try_new(&level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => rt.block_on(run(cfg)),
        Command::Cleanup => rt.block_on(cleanup(cfg)),
        Command::Verify => rt.block_on(verify(cfg)),
        Command::Policy {
            connection_logs_days,
            hourly_stats_days,
            auto_cleanup,
            cleanup_interval_hours,
        } => policy(
            &cfg,
            connection_logs_days,
            hourly_stats_days,
            auto_cleanup,
            cleanup_interval_hours,
        ),
        Command::Version => Ok(()),
    }
}

fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&cfg.primary.path, cfg.primary.busy_timeout)
        .context("opening primary store")?;
    Ok(Arc::new(store))
}

async fn open_analytics(cfg: &Config) -> Result<Option<Arc<ClickHouseClient>>> {
    if !cfg.analytics.enabled {
        return Ok(None);
    }

    let client = ClickHouseClient::new(&cfg.analytics).context("creating ClickHouse client")?;

    if let Err(e) = client.ping().await {
        tracing::warn!(error = %e, "ClickHouse not reachable yet, writes will retry per batch");
    } else if cfg.analytics.create_tables {
        client
            .create_tables()
            .await
            .context("creating analytics tables")?;
    }

    tracing::info!(
        url = %cfg.analytics.base_url(),
        database = %cfg.analytics.database,
        compression = %cfg.analytics.compression,
        "analytics sink enabled",
    );

    Ok(Some(Arc::new(client)))
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting trafficstats",
    );

    let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    metrics.start().await.context("starting health server")?;

    let store = open_store(&cfg)?;
    let analytics = open_analytics(&cfg).await?;

    let pipeline = Arc::new(Pipeline::new(
        store as Arc<dyn PrimaryStore>,
        analytics,
        &cfg,
        Some(Arc::clone(&metrics)),
    ));
    pipeline.start();

    wait_for_signal().await;

    pipeline.shutdown().await;
    metrics.stop();

    tracing::info!("trafficstats stopped");

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "registering SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "waiting for ctrl-c");
    }
    tracing::info!("received SIGINT, shutting down");
}

async fn cleanup(cfg: Config) -> Result<()> {
    let store = open_store(&cfg)?;
    let scheduler = RetentionScheduler::new(store, cfg.retention.clone(), None);

    let outcome = tokio::task::spawn_blocking(move || scheduler.run_now())
        .await
        .context("joining cleanup task")??;

    match outcome {
        CleanupOutcome::Completed(report) => {
            println!(
                "deleted {} rows (compacted: {})",
                report.total_deleted(),
                report.compacted
            );
            for (table, count) in &report.deleted {
                println!("  {table}: {count}");
            }
        }
        CleanupOutcome::Skipped => println!("cleanup already running, skipped"),
    }

    Ok(())
}

async fn verify(cfg: Config) -> Result<()> {
    let Some(analytics) = open_analytics(&cfg).await? else {
        anyhow::bail!("analytics.enabled must be true to verify");
    };
    let store = open_store(&cfg)?;

    let verifier = ConsistencyVerifier::new(store, analytics, cfg.verify.clone(), None);
    let reports = verifier.run_once().await?;

    for r in &reports {
        println!(
            "backend {}: upload {} vs {} ({:+.2}%), download {} vs {} ({:+.2}%)",
            r.backend_id,
            r.primary.upload,
            r.secondary.upload,
            r.upload_drift_pct,
            r.primary.download,
            r.secondary.download,
            r.download_drift_pct,
        );
    }

    if reports.is_empty() {
        println!("no backends to verify");
    }

    Ok(())
}

fn policy(
    cfg: &Config,
    connection_logs_days: Option<u32>,
    hourly_stats_days: Option<u32>,
    auto_cleanup: Option<bool>,
    cleanup_interval_hours: Option<u32>,
) -> Result<()> {
    let store = open_store(cfg)?;
    let mut policy = store.retention_config()?;
    let scheduler = RetentionScheduler::new(Arc::clone(&store) as Arc<dyn PrimaryStore>, cfg.retention.clone(), None);

    let changed = connection_logs_days.is_some()
        || hourly_stats_days.is_some()
        || auto_cleanup.is_some()
        || cleanup_interval_hours.is_some();

    if changed {
        policy.connection_logs_days = connection_logs_days.unwrap_or(policy.connection_logs_days);
        policy.hourly_stats_days = hourly_stats_days.unwrap_or(policy.hourly_stats_days);
        policy.auto_cleanup = auto_cleanup.unwrap_or(policy.auto_cleanup);
        policy.cleanup_interval_hours =
            cleanup_interval_hours.unwrap_or(policy.cleanup_interval_hours);
        scheduler.update_policy(&policy)?;
        policy = store.retention_config()?;
    }

    println!("connection_logs_days: {}", policy.connection_logs_days);
    println!("hourly_stats_days: {}", policy.hourly_stats_days);
    println!("auto_cleanup: {}", policy.auto_cleanup);
    println!("cleanup_interval_hours: {}", policy.cleanup_interval_hours);

    Ok(())
}
