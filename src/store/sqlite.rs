use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::buffer::record::{CountryRecord, TrafficRecord};

use super::{PrimaryStore, RetentionConfig, RetentionTable, WindowSums};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traffic_minute (
    backend_id   INTEGER NOT NULL,
    minute       TEXT    NOT NULL,
    domain       TEXT    NOT NULL,
    ip           TEXT    NOT NULL,
    chain        TEXT    NOT NULL,
    chains       TEXT    NOT NULL,
    rule         TEXT    NOT NULL,
    rule_payload TEXT    NOT NULL,
    source_ip    TEXT    NOT NULL,
    upload       INTEGER NOT NULL DEFAULT 0,
    download     INTEGER NOT NULL DEFAULT 0,
    connections  INTEGER NOT NULL DEFAULT 0,
    last_seen    INTEGER,
    PRIMARY KEY (backend_id, minute, domain, ip, chain, chains, rule, rule_payload, source_ip)
);
CREATE INDEX IF NOT EXISTS idx_traffic_minute_minute ON traffic_minute (minute);

CREATE TABLE IF NOT EXISTS traffic_hourly (
    backend_id   INTEGER NOT NULL,
    hour         TEXT    NOT NULL,
    domain       TEXT    NOT NULL,
    chain        TEXT    NOT NULL,
    rule         TEXT    NOT NULL,
    upload       INTEGER NOT NULL DEFAULT 0,
    download     INTEGER NOT NULL DEFAULT 0,
    connections  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, hour, domain, chain, rule)
);
CREATE INDEX IF NOT EXISTS idx_traffic_hourly_hour ON traffic_hourly (hour);

CREATE TABLE IF NOT EXISTS country_minute (
    backend_id   INTEGER NOT NULL,
    minute       TEXT    NOT NULL,
    country      TEXT    NOT NULL,
    country_name TEXT    NOT NULL,
    continent    TEXT    NOT NULL,
    upload       INTEGER NOT NULL DEFAULT 0,
    download     INTEGER NOT NULL DEFAULT 0,
    connections  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, minute, country, country_name, continent)
);
CREATE INDEX IF NOT EXISTS idx_country_minute_minute ON country_minute (minute);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const UPSERT_TRAFFIC_MINUTE: &str = "
INSERT INTO traffic_minute
    (backend_id, minute, domain, ip, chain, chains, rule, rule_payload, source_ip,
     upload, download, connections, last_seen)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
ON CONFLICT (backend_id, minute, domain, ip, chain, chains, rule, rule_payload, source_ip)
DO UPDATE SET
    upload = upload + excluded.upload,
    download = download + excluded.download,
    connections = connections + excluded.connections,
    last_seen = CASE
        WHEN excluded.last_seen IS NULL THEN last_seen
        WHEN last_seen IS NULL THEN excluded.last_seen
        ELSE MAX(last_seen, excluded.last_seen)
    END";

const UPSERT_TRAFFIC_HOURLY: &str = "
INSERT INTO traffic_hourly
    (backend_id, hour, domain, chain, rule, upload, download, connections)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT (backend_id, hour, domain, chain, rule)
DO UPDATE SET
    upload = upload + excluded.upload,
    download = download + excluded.download,
    connections = connections + excluded.connections";

const UPSERT_COUNTRY_MINUTE: &str = "
INSERT INTO country_minute
    (backend_id, minute, country, country_name, continent, upload, download, connections)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT (backend_id, minute, country, country_name, continent)
DO UPDATE SET
    upload = upload + excluded.upload,
    download = download + excluded.download,
    connections = connections + excluded.connections";

const KEY_CONNECTION_LOGS_DAYS: &str = "retention.connection_logs_days";
const KEY_HOURLY_STATS_DAYS: &str = "retention.hourly_stats_days";
const KEY_AUTO_CLEANUP: &str = "retention.auto_cleanup";
const KEY_CLEANUP_INTERVAL_HOURS: &str = "retention.cleanup_interval_hours";

/// SQLite-backed primary store.
///
/// A single connection is shared behind a mutex; SQLite serializes writers
/// anyway and the workload is a handful of batched transactions per flush.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database file and applies the schema.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite database {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("setting sqlite busy timeout")?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enabling WAL journal mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting synchronous mode")?;

        tracing::info!(path = %path.display(), journal_mode = %mode, "sqlite store opened");

        Self::from_connection(conn)
    }

    /// Opens a private in-memory database. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("applying sqlite schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Counts rows in a table. Diagnostic helper.
    pub fn row_count(&self, table: RetentionTable) -> Result<usize> {
        let conn = self.conn.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("counting rows in {}", table.as_str()))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn read_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("reading setting {key}"))
    }
}

impl PrimaryStore for SqliteStore {
    fn write_traffic_batch(&self, backend_id: i64, records: &[TrafficRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting traffic transaction")?;
        {
            let mut minute_stmt = tx
                .prepare_cached(UPSERT_TRAFFIC_MINUTE)
                .context("preparing traffic_minute upsert")?;
            let mut hourly_stmt = tx
                .prepare_cached(UPSERT_TRAFFIC_HOURLY)
                .context("preparing traffic_hourly upsert")?;

            for record in records {
                let key = &record.key;
                let stats = &record.stats;
                minute_stmt
                    .execute(params![
                        backend_id,
                        key.minute.as_str(),
                        key.domain,
                        key.ip,
                        key.chain,
                        key.chains_label(),
                        key.rule,
                        key.rule_payload,
                        key.source_ip,
                        to_sql_int(stats.upload),
                        to_sql_int(stats.download),
                        to_sql_int(stats.events),
                        stats.last_seen_ms,
                    ])
                    .context("upserting traffic_minute row")?;

                hourly_stmt
                    .execute(params![
                        backend_id,
                        key.minute.hour().as_str(),
                        key.domain,
                        key.chain,
                        key.rule,
                        to_sql_int(stats.upload),
                        to_sql_int(stats.download),
                        to_sql_int(stats.events),
                    ])
                    .context("upserting traffic_hourly row")?;
            }
        }
        tx.commit().context("committing traffic transaction")?;

        Ok(())
    }

    fn write_country_batch(&self, backend_id: i64, records: &[CountryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting country transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(UPSERT_COUNTRY_MINUTE)
                .context("preparing country_minute upsert")?;
            for record in records {
                stmt.execute(params![
                    backend_id,
                    record.minute.as_str(),
                    record.geo.country,
                    record.geo.country_name,
                    record.geo.continent,
                    to_sql_int(record.upload),
                    to_sql_int(record.download),
                    to_sql_int(record.events),
                ])
                .context("upserting country_minute row")?;
            }
        }
        tx.commit().context("committing country transaction")?;

        Ok(())
    }

    fn delete_rows_older_than(&self, table: RetentionTable, cutoff: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let sql = format!(
            "DELETE FROM {} WHERE {} < ?1",
            table.as_str(),
            table.time_column()
        );
        conn.execute(&sql, params![cutoff])
            .with_context(|| format!("deleting aged rows from {}", table.as_str()))
    }

    fn read_window_sums(&self, backend_id: i64, start: &str, end: &str) -> Result<WindowSums> {
        let conn = self.conn.lock();
        let (upload, download): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0)
                 FROM traffic_minute
                 WHERE backend_id = ?1 AND minute >= ?2 AND minute < ?3",
                params![backend_id, start, end],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("reading window sums")?;

        Ok(WindowSums {
            upload: u64::try_from(upload).unwrap_or(0),
            download: u64::try_from(download).unwrap_or(0),
        })
    }

    fn compact(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .context("checkpointing WAL")?;
        conn.execute_batch("VACUUM").context("vacuuming database")?;
        Ok(())
    }

    fn retention_config(&self) -> Result<RetentionConfig> {
        let conn = self.conn.lock();
        let defaults = RetentionConfig::default();

        let parse_u32 = |key: &str, fallback: u32| -> Result<u32> {
            Ok(Self::read_setting(&conn, key)?
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(fallback))
        };

        let connection_logs_days =
            parse_u32(KEY_CONNECTION_LOGS_DAYS, defaults.connection_logs_days)?;
        let hourly_stats_days = parse_u32(KEY_HOURLY_STATS_DAYS, defaults.hourly_stats_days)?;
        let cleanup_interval_hours =
            parse_u32(KEY_CLEANUP_INTERVAL_HOURS, defaults.cleanup_interval_hours)?;
        let auto_cleanup = Self::read_setting(&conn, KEY_AUTO_CLEANUP)?
            .map(|v| matches!(v.trim(), "1" | "true"))
            .unwrap_or(defaults.auto_cleanup);

        Ok(RetentionConfig {
            connection_logs_days,
            hourly_stats_days,
            auto_cleanup,
            cleanup_interval_hours,
        }
        .normalized())
    }

    fn set_retention_config(&self, cfg: &RetentionConfig) -> Result<()> {
        let cfg = cfg.normalized();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting settings transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                )
                .context("preparing settings upsert")?;
            stmt.execute(params![
                KEY_CONNECTION_LOGS_DAYS,
                cfg.connection_logs_days.to_string()
            ])?;
            stmt.execute(params![
                KEY_HOURLY_STATS_DAYS,
                cfg.hourly_stats_days.to_string()
            ])?;
            stmt.execute(params![KEY_AUTO_CLEANUP, cfg.auto_cleanup.to_string()])?;
            stmt.execute(params![
                KEY_CLEANUP_INTERVAL_HOURS,
                cfg.cleanup_interval_hours.to_string()
            ])?;
        }
        tx.commit().context("committing retention settings")?;
        Ok(())
    }

    fn list_backends(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT backend_id FROM traffic_minute ORDER BY backend_id")
            .context("preparing backend listing")?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .context("listing backends")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("reading backend ids")?;
        Ok(ids)
    }
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::key::{format_instant, AggregationKey, MinuteKey};
    use crate::buffer::record::BufferedRecord;
    use crate::event::{GeoLocation, TrafficEvent};

    const TS: i64 = 1_700_000_000_000;

    fn record(domain: &str, ts: i64, upload: u64, download: u64) -> TrafficRecord {
        let event = TrafficEvent {
            domain: domain.to_string(),
            ip: "1.1.1.1".to_string(),
            chain: "P".to_string(),
            chains: vec!["P".to_string()],
            rule: "MATCH".to_string(),
            ..Default::default()
        };
        let mut stats = BufferedRecord::default();
        stats.add(upload, download, Some(ts));
        TrafficRecord {
            key: AggregationKey::from_event(1, &event, ts),
            stats,
        }
    }

    #[test]
    fn test_traffic_upsert_sums_existing_rows() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .write_traffic_batch(1, &[record("a.com", TS, 10, 20)])
            .expect("first write");
        store
            .write_traffic_batch(1, &[record("a.com", TS, 5, 5)])
            .expect("second write");

        assert_eq!(store.row_count(RetentionTable::TrafficMinute).unwrap(), 1);
        assert_eq!(store.row_count(RetentionTable::TrafficHourly).unwrap(), 1);

        let start = MinuteKey::from_millis(TS).to_string();
        let end = format_instant(TS + 60_000);
        let sums = store.read_window_sums(1, &start, &end).expect("sums");
        assert_eq!(sums, WindowSums { upload: 15, download: 25 });
    }

    #[test]
    fn test_window_sums_respect_bounds_and_backend() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .write_traffic_batch(
                1,
                &[
                    record("a.com", TS, 1, 1),
                    record("b.com", TS + 600_000, 100, 100),
                ],
            )
            .expect("write");

        let start = MinuteKey::from_millis(TS).to_string();
        let end = MinuteKey::from_millis(TS + 600_000).to_string();
        let sums = store.read_window_sums(1, &start, &end).expect("sums");
        assert_eq!(sums, WindowSums { upload: 1, download: 1 });

        let other = store.read_window_sums(2, &start, &end).expect("sums");
        assert_eq!(other, WindowSums::default());
    }

    #[test]
    fn test_country_upsert() {
        let store = SqliteStore::open_in_memory().expect("open");
        let rec = CountryRecord {
            minute: MinuteKey::from_millis(TS),
            geo: GeoLocation {
                country: "DE".to_string(),
                country_name: "Germany".to_string(),
                continent: "EU".to_string(),
            },
            upload: 3,
            download: 4,
            events: 1,
        };
        store.write_country_batch(1, &[rec.clone()]).expect("write");
        store.write_country_batch(1, &[rec]).expect("write");
        assert_eq!(store.row_count(RetentionTable::CountryMinute).unwrap(), 1);
    }

    #[test]
    fn test_delete_rows_older_than_is_strict() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .write_traffic_batch(
                1,
                &[
                    record("old.com", TS, 1, 1),
                    record("new.com", TS + 120_000, 1, 1),
                ],
            )
            .expect("write");

        let cutoff = MinuteKey::from_millis(TS + 120_000).to_string();
        let deleted = store
            .delete_rows_older_than(RetentionTable::TrafficMinute, &cutoff)
            .expect("delete");
        assert_eq!(deleted, 1);
        assert_eq!(store.row_count(RetentionTable::TrafficMinute).unwrap(), 1);
    }

    #[test]
    fn test_retention_config_defaults_and_roundtrip() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert_eq!(store.retention_config().unwrap(), RetentionConfig::default());

        let cfg = RetentionConfig {
            connection_logs_days: 3,
            hourly_stats_days: 0,
            auto_cleanup: false,
            cleanup_interval_hours: 12,
        };
        store.set_retention_config(&cfg).expect("save");

        let loaded = store.retention_config().expect("load");
        assert_eq!(loaded.connection_logs_days, 3);
        assert_eq!(loaded.hourly_stats_days, 1);
        assert!(!loaded.auto_cleanup);
        assert_eq!(loaded.cleanup_interval_hours, 12);
    }

    #[test]
    fn test_list_backends() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(store.list_backends().unwrap().is_empty());
        store
            .write_traffic_batch(7, &[record("a.com", TS, 1, 1)])
            .expect("write");
        // Stored backend id comes from the batch argument.
        assert_eq!(store.list_backends().unwrap(), vec![7]);
    }

    #[test]
    fn test_compact_in_memory() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.compact().expect("compact");
    }
}
