//! Durable state and HTTP transport for metfeed: the SQLite-backed record store and
//! run audit log, the raw page archive, and the retrying feed fetcher.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metfeed_core::{
    CanonicalRecord, ConflictPolicy, Dataset, DatasetSchema, FieldValue, IdKind, LastRunSummary,
    RecordId, RunReport, RunRecord, StoreStats,
};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "metfeed-storage";

pub const RUNS_TABLE: &str = "scraper_analytics";

/// One archived page body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPage {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// The same page with the same body was already on disk.
    pub already_present: bool,
}

/// Raw feed responses laid out as `<run stamp>/<dataset>/page-NNNN-<hash prefix>.<ext>`.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_path(
        fetched_at: DateTime<Utc>,
        dataset: Dataset,
        page: u32,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let short_hash = content_hash.get(..16).unwrap_or(content_hash);
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(dataset.run_type())
            .join(format!("page-{page:04}-{short_hash}.{ext}"))
    }

    /// Write one page body. Refetching the same page with an identical body within one run
    /// leaves the existing file in place.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        dataset: Dataset,
        page: u32,
        extension: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = hex::encode(Sha256::digest(body));
        let relative_path = Self::page_path(fetched_at, dataset, page, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let written = write_atomically(&absolute_path, body).await?;
        Ok(ArchivedPage {
            relative_path,
            absolute_path,
            content_hash,
            byte_size: body.len(),
            already_present: !written,
        })
    }
}

/// Temp file plus rename. Returns false when `target` already existed.
async fn write_atomically(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let dir = target
        .parent()
        .with_context(|| format!("archive path {} has no parent", target.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating archive directory {}", dir.display()))?;
    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking {}", target.display()))?
    {
        return Ok(false);
    }

    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(false);
            }
            Err(err).with_context(|| format!("renaming into {}", target.display()))
        }
    }
}

/// Server errors and throttling are worth repeating; client errors are not.
fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Doubling delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.first_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => retryable_error(err),
            FetchError::HttpStatus { status, .. } => {
                StatusCode::from_u16(*status).is_ok_and(retryable_status)
            }
        }
    }
}

/// Feed fetcher with a bounded per-request timeout and a small retry budget.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(
        &self,
        dataset: Dataset,
        url: &str,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %dataset, url);
        self.fetch_with_retry(url, accept).instrument(span).await
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            let error = match self.send_once(url, accept).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if retry >= self.retry.retries || !error.is_retryable() {
                return Err(error);
            }
            let delay = self.retry.delay_before_retry(retry);
            warn!(%error, retry, delay_ms = delay.as_millis() as u64, "retrying feed request");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn send_once(&self, url: &str, accept: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).header(ACCEPT, accept).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode {column}: {message}")]
    Decode {
        column: &'static str,
        message: String,
    },
    #[error("record {id} belongs to {actual}, not {expected}")]
    DatasetMismatch {
        id: String,
        expected: Dataset,
        actual: Dataset,
    },
}

/// Shared SQLite pool backing both the record tables and the run log.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        Self::connect(path, true).await
    }

    /// Open a database that must already exist. Nothing is created on disk.
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::connect(path.as_ref(), false).await
    }

    async fn connect(path: &Path, create: bool) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create missing tables and columns. Safe to run on every start and on databases
    /// written by older releases.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for dataset in Dataset::ALL {
            let schema = dataset.schema();
            sqlx::query(&create_table_sql(schema))
                .execute(&mut *tx)
                .await?;
            let wanted = schema
                .columns
                .iter()
                .chain(std::iter::once(&schema.ingested_at_column))
                .map(|c| (*c, "TEXT"));
            add_missing_columns(&mut tx, schema.table, wanted).await?;
        }
        sqlx::query(CREATE_RUNS_TABLE).execute(&mut *tx).await?;
        add_missing_columns(&mut tx, RUNS_TABLE, [("records_dropped", "INTEGER")]).await?;
        sqlx::query(CREATE_RUNS_INDEX).execute(&mut *tx).await?;
        tx.commit().await?;
        info!("database schema ready");
        Ok(())
    }

    pub fn dedup_store(&self) -> DedupStore {
        DedupStore {
            pool: self.pool.clone(),
        }
    }

    pub fn run_logger(&self) -> RunLogger {
        RunLogger {
            pool: self.pool.clone(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const CREATE_RUNS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS scraper_analytics (
        run_id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_timestamp TEXT NOT NULL,
        run_type TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        duration_seconds REAL,
        records_fetched INTEGER,
        records_inserted INTEGER,
        records_dropped INTEGER,
        success BOOLEAN,
        error_message TEXT,
        api_response_time REAL,
        total_records_in_db INTEGER
    )
"#;

const CREATE_RUNS_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_scraper_analytics_type_success
        ON scraper_analytics (run_type, success, run_id)
"#;

const INSERT_RUN: &str = r#"
    INSERT INTO scraper_analytics (
        run_timestamp, run_type, start_time, end_time, duration_seconds,
        records_fetched, records_inserted, records_dropped, success, error_message,
        api_response_time, total_records_in_db
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

fn create_table_sql(schema: &DatasetSchema) -> String {
    let id_type = match schema.id_kind {
        IdKind::Text => "TEXT",
        IdKind::Integer => "INTEGER",
    };
    let mut columns = vec![format!("\"{}\" {} PRIMARY KEY", schema.id_column, id_type)];
    columns.extend(schema.columns.iter().map(|c| format!("\"{c}\" TEXT")));
    columns.push(format!("\"{}\" TEXT", schema.ingested_at_column));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        schema.table,
        columns.join(",\n    ")
    )
}

fn upsert_sql(schema: &DatasetSchema) -> String {
    let mut columns = Vec::with_capacity(schema.columns.len() + 2);
    columns.push(schema.id_column);
    columns.extend_from_slice(schema.columns);
    columns.push(schema.ingested_at_column);

    let column_list = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let on_conflict = match schema.conflict {
        ConflictPolicy::Replace => format!(
            "DO UPDATE SET {}",
            columns[1..]
                .iter()
                .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        ConflictPolicy::Ignore => "DO NOTHING".to_string(),
    };
    format!(
        "INSERT INTO {} ({column_list}) VALUES ({placeholders}) ON CONFLICT(\"{}\") {on_conflict}",
        schema.table, schema.id_column
    )
}

async fn add_missing_columns<'c>(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    columns: impl IntoIterator<Item = (&'c str, &'c str)>,
) -> Result<(), StorageError> {
    let existing = sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|name| name.to_ascii_lowercase())
        .collect::<HashSet<_>>();

    for (name, sql_type) in columns {
        if existing.contains(&name.to_ascii_lowercase()) {
            continue;
        }
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN \"{name}\" {sql_type}"))
            .execute(&mut **tx)
            .await?;
        info!(table, column = name, "added missing column");
    }
    Ok(())
}

async fn count_rows(pool: &SqlitePool, schema: &DatasetSchema) -> Result<u64, StorageError> {
    let sql = format!("SELECT COUNT(*) FROM {}", schema.table);
    let count = sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?;
    Ok(to_u64(count))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Accepts RFC 3339 and the zone-less ISO form older databases were written with (read as UTC).
fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
        })
        .map_err(|e| StorageError::Decode {
            column,
            message: format!("{value:?}: {e}"),
        })
}

/// Keyed record persistence with per-dataset conflict policy.
#[derive(Debug, Clone)]
pub struct DedupStore {
    pool: SqlitePool,
}

impl DedupStore {
    /// Write `records` and return how many rows were inserted or replaced.
    ///
    /// Never fails: storage errors are logged and reported as zero writes, leaving
    /// whatever earlier calls committed intact.
    pub async fn upsert(&self, dataset: Dataset, records: &[CanonicalRecord]) -> usize {
        match self.try_upsert(dataset, records).await {
            Ok(written) => {
                info!(%dataset, written, offered = records.len(), "stored records");
                written
            }
            Err(error) => {
                error!(%dataset, %error, offered = records.len(), "upsert failed; batch discarded");
                0
            }
        }
    }

    /// One transaction per call. Replace-policy rows count whenever written; ignore-policy
    /// rows count only when new.
    pub async fn try_upsert(
        &self,
        dataset: Dataset,
        records: &[CanonicalRecord],
    ) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let schema = dataset.schema();
        let sql = upsert_sql(schema);

        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for record in records {
            if record.dataset != dataset {
                return Err(StorageError::DatasetMismatch {
                    id: record.id.to_string(),
                    expected: dataset,
                    actual: record.dataset,
                });
            }
            let mut query = match &record.id {
                RecordId::Numeric(id) => sqlx::query(&sql).bind(*id),
                RecordId::Text(id) => sqlx::query(&sql).bind(id.clone()),
            };
            for column in schema.columns {
                query = query.bind(record.get(column).map(str::to_string));
            }
            let result = query
                .bind(record.ingested_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                written += 1;
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn get(
        &self,
        dataset: Dataset,
        id: &RecordId,
    ) -> Result<Option<CanonicalRecord>, StorageError> {
        let schema = dataset.schema();
        let sql = format!(
            "SELECT * FROM {} WHERE \"{}\" = ?",
            schema.table, schema.id_column
        );
        let query = match id {
            RecordId::Numeric(id) => sqlx::query(&sql).bind(*id),
            RecordId::Text(id) => sqlx::query(&sql).bind(id.clone()),
        };
        let Some(row) = query.fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let ingested_at = row
            .try_get::<Option<String>, _>(schema.ingested_at_column)?
            .map(|v| parse_timestamp(schema.ingested_at_column, &v))
            .transpose()?
            .unwrap_or_default();
        let mut fields = Vec::with_capacity(schema.columns.len());
        for &name in schema.columns {
            fields.push(FieldValue {
                name,
                value: row.try_get::<Option<String>, _>(name)?,
            });
        }
        Ok(Some(CanonicalRecord {
            dataset,
            id: id.clone(),
            fields,
            ingested_at,
        }))
    }

    pub async fn count(&self, dataset: Dataset) -> Result<u64, StorageError> {
        count_rows(&self.pool, dataset.schema()).await
    }
}

/// Append-only audit log of pipeline runs.
#[derive(Debug, Clone)]
pub struct RunLogger {
    pool: SqlitePool,
}

impl RunLogger {
    /// Append one audit row. Failures are logged and swallowed so an audit outage never
    /// changes the outcome of the run being reported.
    pub async fn record(&self, report: &RunReport) {
        if let Err(error) = self.try_record(report).await {
            warn!(dataset = %report.dataset, %error, "failed to append run audit row");
        }
    }

    pub async fn try_record(&self, report: &RunReport) -> Result<i64, StorageError> {
        let total_rows_after = match count_rows(&self.pool, report.dataset.schema()).await {
            Ok(total) => Some(total),
            Err(error) => {
                warn!(dataset = %report.dataset, %error, "could not count rows for audit snapshot");
                None
            }
        };

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(INSERT_RUN)
            .bind(Utc::now().to_rfc3339())
            .bind(report.dataset.run_type())
            .bind(report.started_at.to_rfc3339())
            .bind(report.ended_at.to_rfc3339())
            .bind(report.duration_seconds())
            .bind(to_i64(report.counts.fetched))
            .bind(to_i64(report.counts.inserted))
            .bind(to_i64(report.counts.dropped))
            .bind(report.success())
            .bind(report.error.clone())
            .bind(report.fetch_seconds)
            .bind(total_rows_after.map(to_i64))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let run_id = result.last_insert_rowid();
        info!(
            run_id,
            dataset = %report.dataset,
            success = report.success(),
            fetched = report.counts.fetched,
            inserted = report.counts.inserted,
            dropped = report.counts.dropped,
            "logged run"
        );
        Ok(run_id)
    }

    /// Most recent successful run for `dataset`, by sequence id.
    pub async fn last_success(&self, dataset: Dataset) -> Result<Option<RunRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT *
              FROM scraper_analytics
             WHERE run_type = ? AND success = 1
             ORDER BY run_id DESC
             LIMIT 1
            "#,
        )
        .bind(dataset.run_type())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_record_from_row).transpose()
    }

    /// Newest runs first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<RunRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM scraper_analytics ORDER BY run_id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_record_from_row).collect()
    }

    /// Status snapshot over both record tables and the run log. Degrades to the default
    /// when the store cannot be read.
    pub async fn stats(&self) -> StoreStats {
        match self.try_stats().await {
            Ok(stats) => stats,
            Err(error) => {
                warn!(%error, "status query failed; reporting empty stats");
                StoreStats::default()
            }
        }
    }

    async fn try_stats(&self) -> Result<StoreStats, StorageError> {
        let alerts_total = count_rows(&self.pool, Dataset::Alerts.schema()).await?;
        let forecasts_total = count_rows(&self.pool, Dataset::Forecasts.schema()).await?;
        let latest_alert_date = latest_value(&self.pool, Dataset::Alerts.schema()).await?;
        let latest_forecast_date = latest_value(&self.pool, Dataset::Forecasts.schema()).await?;
        let total_runs = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM scraper_analytics")
            .fetch_one(&self.pool)
            .await?;
        let last_run = sqlx::query(
            "SELECT run_type, run_timestamp, success FROM scraper_analytics \
             ORDER BY run_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| -> Result<LastRunSummary, StorageError> {
            Ok(LastRunSummary {
                run_type: row.try_get("run_type")?,
                run_timestamp: row.try_get("run_timestamp")?,
                success: row.try_get::<Option<bool>, _>("success")?.unwrap_or(false),
            })
        })
        .transpose()?;

        Ok(StoreStats {
            alerts_total,
            forecasts_total,
            latest_alert_date,
            latest_forecast_date,
            total_runs: to_u64(total_runs),
            last_run,
        })
    }
}

async fn latest_value(
    pool: &SqlitePool,
    schema: &DatasetSchema,
) -> Result<Option<String>, StorageError> {
    let sql = format!("SELECT MAX(\"{}\") FROM {}", schema.latest_column, schema.table);
    Ok(sqlx::query_scalar::<_, Option<String>>(&sql)
        .fetch_one(pool)
        .await?)
}

fn run_record_from_row(row: &SqliteRow) -> Result<RunRecord, StorageError> {
    let run_type: String = row.try_get("run_type")?;
    let run_type = Dataset::from_run_type(&run_type).ok_or_else(|| StorageError::Decode {
        column: "run_type",
        message: format!("unknown run type {run_type:?}"),
    })?;
    let started_at = parse_timestamp("start_time", &row.try_get::<String, _>("start_time")?)?;
    let ended_at = row
        .try_get::<Option<String>, _>("end_time")?
        .map(|v| parse_timestamp("end_time", &v))
        .transpose()?
        .unwrap_or(started_at);
    let count = |column: &str| -> Result<u64, StorageError> {
        Ok(row
            .try_get::<Option<i64>, _>(column)?
            .map(to_u64)
            .unwrap_or_default())
    };

    Ok(RunRecord {
        run_id: row.try_get("run_id")?,
        run_timestamp: parse_timestamp(
            "run_timestamp",
            &row.try_get::<String, _>("run_timestamp")?,
        )?,
        run_type,
        started_at,
        ended_at,
        duration_seconds: row
            .try_get::<Option<f64>, _>("duration_seconds")?
            .unwrap_or_default(),
        fetched_count: count("records_fetched")?,
        inserted_count: count("records_inserted")?,
        dropped_count: count("records_dropped")?,
        success: row.try_get::<Option<bool>, _>("success")?.unwrap_or(false),
        error_message: row.try_get("error_message")?,
        fetch_seconds: row.try_get("api_response_time")?,
        total_rows_after: row
            .try_get::<Option<i64>, _>("total_records_in_db")?
            .map(to_u64),
    })
}
