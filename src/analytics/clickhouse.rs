use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;

use crate::config::AnalyticsConfig;
use crate::store::WindowSums;

use super::{AnalyticsError, AnalyticsSink, AnalyticsTable, RowBatch};

/// Analytics table definitions, applied in order when `create_tables` is set.
/// `{db}` is replaced with the configured database.
static SCHEMA: &[(&str, &str)] = &[
    (
        "traffic_detail",
        "CREATE TABLE IF NOT EXISTS {db}.traffic_detail (
            backend_id Int64,
            minute DateTime('UTC'),
            domain String,
            ip String,
            chain String,
            chains String,
            rule String,
            rule_payload String,
            source_ip String,
            upload UInt64,
            download UInt64,
            connections UInt64,
            last_seen_ms Nullable(Int64)
        ) ENGINE = MergeTree
        PARTITION BY toYYYYMMDD(minute)
        ORDER BY (backend_id, minute, domain, ip)",
    ),
    (
        "traffic_minute",
        "CREATE TABLE IF NOT EXISTS {db}.traffic_minute (
            backend_id Int64,
            minute DateTime('UTC'),
            upload UInt64,
            download UInt64,
            connections UInt64
        ) ENGINE = SummingMergeTree((upload, download, connections))
        PARTITION BY toYYYYMMDD(minute)
        ORDER BY (backend_id, minute)",
    ),
    (
        "country_minute",
        "CREATE TABLE IF NOT EXISTS {db}.country_minute (
            backend_id Int64,
            minute DateTime('UTC'),
            country String,
            country_name String,
            continent String,
            upload UInt64,
            download UInt64,
            connections UInt64
        ) ENGINE = SummingMergeTree((upload, download, connections))
        PARTITION BY toYYYYMMDD(minute)
        ORDER BY (backend_id, minute, country, country_name, continent)",
    ),
];

const WINDOW_SUMS_QUERY: &str = "SELECT
    toUInt64(sum(upload)) AS upload,
    toUInt64(sum(download)) AS download
FROM {db}.traffic_minute
WHERE backend_id = {backend:Int64}
  AND minute >= parseDateTimeBestEffort({start:String}, 'UTC')
  AND minute < parseDateTimeBestEffort({end:String}, 'UTC')
FORMAT JSONEachRow";

/// ClickHouse client speaking the HTTP interface.
///
/// Inserts are sent as `JSONEachRow` bodies, optionally compressed; reads use
/// server-side query parameters so values never get spliced into SQL.
pub struct ClickHouseClient {
    client: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
    encoding: BodyEncoding,
    timeout: Duration,
}

impl ClickHouseClient {
    /// Creates a new client with the given configuration.
    pub fn new(cfg: &AnalyticsConfig) -> Result<Self> {
        if !is_identifier(&cfg.database) {
            bail!("invalid analytics database name: {}", cfg.database);
        }

        let encoding = BodyEncoding::parse(&cfg.compression)?;

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            base_url: cfg.base_url(),
            database: cfg.database.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            encoding,
            timeout: cfg.timeout,
        })
    }

    /// Checks that the server answers `/ping`.
    pub async fn ping(&self) -> Result<(), AnalyticsError> {
        let resp = self
            .client
            .get(format!("{}ping", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        check_status(resp).await.map(|_| ())
    }

    /// Creates the analytics tables if they do not exist.
    pub async fn create_tables(&self) -> Result<(), AnalyticsError> {
        for (table, ddl) in SCHEMA {
            let sql = ddl.replace("{db}", &self.database);
            self.execute(&sql, &[]).await?;
            tracing::debug!(table, "analytics table ensured");
        }

        tracing::info!(database = %self.database, tables = SCHEMA.len(), "analytics schema ready");

        Ok(())
    }

    fn insert_query(&self, table: AnalyticsTable) -> String {
        format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.database,
            table.as_str()
        )
    }

    /// Runs a statement with an empty body and returns the response text.
    async fn execute(&self, sql: &str, params: &[(&str, String)]) -> Result<String, AnalyticsError> {
        let mut query: Vec<(String, String)> = vec![
            ("query".to_string(), sql.to_string()),
            (
                "output_format_json_quote_64bit_integers".to_string(),
                "0".to_string(),
            ),
        ];
        for (name, value) in params {
            query.push((format!("param_{name}"), value.clone()));
        }

        let resp = self
            .authorized(self.client.post(&self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        check_status(resp).await
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
    }

    fn transport_error(&self, e: reqwest::Error) -> AnalyticsError {
        if e.is_timeout() {
            AnalyticsError::Timeout(self.timeout)
        } else {
            AnalyticsError::Transport(e.to_string())
        }
    }
}

impl AnalyticsSink for ClickHouseClient {
    async fn insert(&self, batch: &RowBatch) -> Result<(), AnalyticsError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = batch.to_ndjson()?;
        let raw_len = body.len();
        let body = self
            .encoding
            .encode(body)
            .map_err(|e| AnalyticsError::Encode(e.to_string()))?;

        let mut request = self
            .authorized(self.client.post(&self.base_url))
            .query(&[
                ("query", self.insert_query(batch.table())),
                ("date_time_input_format", "best_effort".to_string()),
            ])
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = self.encoding.header() {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = request.send().await.map_err(|e| self.transport_error(e))?;
        check_status(resp).await?;

        tracing::debug!(
            table = batch.table().as_str(),
            rows = batch.len(),
            bytes = raw_len,
            "inserted batch into ClickHouse",
        );

        Ok(())
    }

    async fn window_sums(
        &self,
        backend_id: i64,
        start: &str,
        end: &str,
    ) -> Result<WindowSums, AnalyticsError> {
        let sql = WINDOW_SUMS_QUERY.replace("{db}", &self.database);
        let text = self
            .execute(
                &sql,
                &[
                    ("backend", backend_id.to_string()),
                    ("start", start.to_string()),
                    ("end", end.to_string()),
                ],
            )
            .await?;

        parse_window_sums(&text)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<String, AnalyticsError> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| AnalyticsError::Transport(e.to_string()))?;

    if status != StatusCode::OK {
        return Err(AnalyticsError::Status {
            status: status.as_u16(),
            body: body.trim().chars().take(512).collect(),
        });
    }

    Ok(body)
}

/// Parses the single `JSONEachRow` line returned by the window query.
fn parse_window_sums(text: &str) -> Result<WindowSums, AnalyticsError> {
    match text.lines().find(|l| !l.trim().is_empty()) {
        Some(line) => {
            serde_json::from_str(line).map_err(|e| AnalyticsError::Decode(e.to_string()))
        }
        None => Ok(WindowSums::default()),
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Request body encoding for inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyEncoding {
    Identity,
    Gzip,
    Zstd,
    Deflate,
}

impl BodyEncoding {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "" | "none" => Self::Identity,
            "gzip" => Self::Gzip,
            "zstd" => Self::Zstd,
            "zlib" => Self::Deflate,
            other => bail!("unsupported compression: {other}"),
        })
    }

    /// Value for the `Content-Encoding` header, if any.
    fn header(self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Deflate => Some("deflate"),
        }
    }

    fn encode(self, body: Vec<u8>) -> Result<Vec<u8>> {
        use flate2::write::{GzEncoder, ZlibEncoder};
        use flate2::Compression;

        match self {
            Self::Identity => Ok(body),
            Self::Gzip => {
                let mut out = GzEncoder::new(Vec::new(), Compression::default());
                out.write_all(&body).context("gzip write")?;
                out.finish().context("gzip finish")
            }
            Self::Zstd => zstd::encode_all(body.as_slice(), 0).context("zstd encode"),
            Self::Deflate => {
                let mut out = ZlibEncoder::new(Vec::new(), Compression::default());
                out.write_all(&body).context("zlib write")?;
                out.finish().context("zlib finish")
            }
        }
    }
}
