//! Ingestion orchestration: configuration, the staleness gate, pagination, and the
//! per-dataset run state machine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metfeed_adapters::{
    FeedError, FeedPage, FeedSource, ForecastApiSource, RawRecord, RecordNormalizer,
    RssAlertSource, DEFAULT_ALERTS_URL, DEFAULT_FORECASTS_URL,
};
use metfeed_core::{Dataset, RunCounts, RunReport, StoreStats};
use metfeed_storage::{
    Database, DedupStore, HttpClientConfig, HttpFetcher, PageArchive, RunLogger,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "metfeed-sync";

pub const DEFAULT_DB_PATH: &str = "./database/weather_forecasts.db";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0 Safari/537.36";
/// Top of every minute.
pub const DEFAULT_WATCH_CRON: &str = "0 * * * * *";

/// Minimum age of the last successful run before a dataset is fetched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdTable {
    pub alerts: chrono::Duration,
    pub forecasts: chrono::Duration,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            alerts: chrono::Duration::minutes(10),
            forecasts: chrono::Duration::minutes(60),
        }
    }
}

impl ThresholdTable {
    pub fn threshold(&self, dataset: Dataset) -> chrono::Duration {
        match dataset {
            Dataset::Alerts => self.alerts,
            Dataset::Forecasts => self.forecasts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub db_path: PathBuf,
    pub alerts_url: String,
    pub forecasts_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub watch_cron: String,
    pub thresholds: ThresholdTable,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            alerts_url: DEFAULT_ALERTS_URL.to_string(),
            forecasts_url: DEFAULT_FORECASTS_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            archive_dir: None,
            watch_cron: DEFAULT_WATCH_CRON.to_string(),
            thresholds: ThresholdTable::default(),
        }
    }
}

/// Optional YAML file layered over the environment. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverlay {
    pub db_path: Option<PathBuf>,
    pub alerts_url: Option<String>,
    pub forecasts_url: Option<String>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub archive_dir: Option<PathBuf>,
    pub watch_cron: Option<String>,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            db_path: var("METFEED_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            alerts_url: var("METFEED_ALERTS_URL").unwrap_or(defaults.alerts_url),
            forecasts_url: var("METFEED_FORECASTS_URL").unwrap_or(defaults.forecasts_url),
            user_agent: var("METFEED_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: var("METFEED_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            archive_dir: var("METFEED_ARCHIVE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            watch_cron: var("METFEED_WATCH_CRON").unwrap_or(defaults.watch_cron),
            thresholds: defaults.thresholds,
        }
    }

    pub fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        if let Some(v) = overlay.db_path {
            self.db_path = v;
        }
        if let Some(v) = overlay.alerts_url {
            self.alerts_url = v;
        }
        if let Some(v) = overlay.forecasts_url {
            self.forecasts_url = v;
        }
        if let Some(v) = overlay.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = overlay.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = overlay.archive_dir {
            self.archive_dir = Some(v);
        }
        if let Some(v) = overlay.watch_cron {
            self.watch_cron = v;
        }
    }

    /// Environment first, then the YAML file at `path` if given.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(path) = path {
            let text = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let overlay: ConfigOverlay = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply_overlay(overlay);
        }
        Ok(config)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

/// Which datasets an invocation touches, and whether the staleness gate applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Alerts,
    Forecasts,
    All,
    Auto,
}

impl RunMode {
    pub fn datasets(self) -> &'static [Dataset] {
        match self {
            RunMode::Alerts => &[Dataset::Alerts],
            RunMode::Forecasts => &[Dataset::Forecasts],
            RunMode::All | RunMode::Auto => &Dataset::ALL,
        }
    }

    /// Forced modes run every selected dataset regardless of staleness.
    pub fn is_forced(self) -> bool {
        !matches!(self, RunMode::Auto)
    }
}

/// Staleness gate over the run log.
#[derive(Debug, Clone)]
pub struct Scheduler {
    runs: RunLogger,
    thresholds: ThresholdTable,
}

impl Scheduler {
    pub fn new(runs: RunLogger, thresholds: ThresholdTable) -> Self {
        Self { runs, thresholds }
    }

    /// Due when no successful run exists or the last one started at least the
    /// dataset's threshold ago. An unreadable run log counts as due.
    pub async fn is_due(&self, dataset: Dataset, now: DateTime<Utc>) -> bool {
        match self.runs.last_success(dataset).await {
            Ok(None) => {
                info!(%dataset, "no successful run on record");
                true
            }
            Ok(Some(last)) => {
                let elapsed = now - last.started_at;
                let threshold = self.thresholds.threshold(dataset);
                let due = elapsed >= threshold;
                debug!(
                    %dataset,
                    last_run_id = last.run_id,
                    elapsed_secs = elapsed.num_seconds(),
                    threshold_secs = threshold.num_seconds(),
                    due,
                    "staleness check"
                );
                due
            }
            Err(error) => {
                warn!(%dataset, %error, "run log unavailable; treating dataset as due");
                true
            }
        }
    }
}

/// Everything a pagination pass produced, including a terminal error if one cut it short.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub items: Vec<RawRecord>,
    pub pages: u32,
    pub error: Option<FeedError>,
    pub fetch_seconds: f64,
}

/// Walk pages from 1 until the metadata says there are no more, no page count is reported,
/// or a page fails. Items from pages fetched before a failure are kept.
pub async fn fetch_to_completion(
    source: &dyn FeedSource,
    archive: Option<&PageArchive>,
    fetched_at: DateTime<Utc>,
) -> FetchOutcome {
    let dataset = source.dataset();
    let mut outcome = FetchOutcome::default();
    let mut page = 1u32;
    loop {
        let started = Instant::now();
        let result = source.fetch_page(page).await;
        outcome.fetch_seconds += started.elapsed().as_secs_f64();

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(%dataset, page, %error, "page fetch failed; keeping earlier pages");
                outcome.error = Some(error);
                break;
            }
        };
        outcome.pages += 1;
        if let Some(archive) = archive {
            archive_page(archive, dataset, fetched_at, page, &fetched).await;
        }

        // Bounded by our own counter so a provider that never advances currentPage still ends.
        let more =
            fetched.has_next(page) && matches!(fetched.page_count, Some(count) if page < count);
        outcome.items.extend(fetched.items);
        if !more {
            break;
        }
        page += 1;
    }
    outcome
}

async fn archive_page(
    archive: &PageArchive,
    dataset: Dataset,
    fetched_at: DateTime<Utc>,
    number: u32,
    page: &FeedPage,
) {
    match archive
        .store_page(fetched_at, dataset, number, page.extension, &page.body)
        .await
    {
        Ok(stored) => debug!(
            path = %stored.relative_path.display(),
            bytes = stored.byte_size,
            already_present = stored.already_present,
            "archived raw page"
        ),
        Err(error) => warn!(
            %dataset,
            page = number,
            error = %format!("{error:#}"),
            "failed to archive raw page"
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub pages: u32,
    pub report: RunReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatasetOutcome {
    Skipped { dataset: Dataset },
    Completed(RunOutcome),
}

impl DatasetOutcome {
    pub fn dataset(&self) -> Dataset {
        match self {
            DatasetOutcome::Skipped { dataset } => *dataset,
            DatasetOutcome::Completed(outcome) => outcome.report.dataset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationReport {
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<DatasetOutcome>,
}

impl InvocationReport {
    pub fn completed(&self) -> impl Iterator<Item = &RunOutcome> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            DatasetOutcome::Completed(run) => Some(run),
            DatasetOutcome::Skipped { .. } => None,
        })
    }

    pub fn all_succeeded(&self) -> bool {
        self.completed().all(|run| run.report.success())
    }
}

/// Runs the fetch, normalize, persist, log sequence for each selected dataset.
pub struct Orchestrator {
    db: Database,
    store: DedupStore,
    runs: RunLogger,
    scheduler: Scheduler,
    normalizer: RecordNormalizer,
    archive: Option<PageArchive>,
    sources: BTreeMap<Dataset, Box<dyn FeedSource>>,
}

impl Orchestrator {
    /// Orchestrator with no feeds attached; add them with [`Orchestrator::with_source`].
    pub fn new(config: &IngestConfig, db: Database) -> Self {
        let runs = db.run_logger();
        Self {
            store: db.dedup_store(),
            scheduler: Scheduler::new(runs.clone(), config.thresholds),
            runs,
            db,
            normalizer: RecordNormalizer::new(),
            archive: config.archive_dir.clone().map(PageArchive::new),
            sources: BTreeMap::new(),
        }
    }

    /// Open and migrate the database and attach the provider feeds named in `config`.
    pub async fn connect(config: &IngestConfig) -> Result<Self> {
        let db = Database::open(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path.display()))?;
        db.migrate().await.context("migrating database schema")?;
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(config, db)
            .with_source(Box::new(RssAlertSource::new(http.clone(), &config.alerts_url)))
            .with_source(Box::new(ForecastApiSource::new(http, &config.forecasts_url))))
    }

    /// Attach `source`, replacing any feed already attached for its dataset.
    pub fn with_source(mut self, source: Box<dyn FeedSource>) -> Self {
        self.sources.insert(source.dataset(), source);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn stats(&self) -> StoreStats {
        self.runs.stats().await
    }

    /// Never fails: every per-dataset error ends up in that dataset's audit row.
    pub async fn run(&self, mode: RunMode) -> InvocationReport {
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(mode.datasets().len());

        for &dataset in mode.datasets() {
            if !mode.is_forced() && !self.scheduler.is_due(dataset, Utc::now()).await {
                info!(%dataset, "not due; skipping");
                outcomes.push(DatasetOutcome::Skipped { dataset });
                continue;
            }

            let run_id = Uuid::new_v4();
            let span = info_span!("ingest_run", run = %run_id, %dataset);
            let outcome = self.run_dataset(run_id, dataset).instrument(span).await;
            outcomes.push(DatasetOutcome::Completed(outcome));
        }

        InvocationReport {
            mode,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        }
    }

    async fn run_dataset(&self, run_id: Uuid, dataset: Dataset) -> RunOutcome {
        let started_at = Utc::now();
        info!("run started");

        let fetched = match self.sources.get(&dataset) {
            Some(source) => {
                fetch_to_completion(source.as_ref(), self.archive.as_ref(), started_at).await
            }
            None => FetchOutcome::default(),
        };
        let (records, dropped) = self.normalizer.normalize_all(dataset, &fetched.items, Utc::now());
        let inserted = self.store.upsert(dataset, &records).await;

        let error = match &fetched.error {
            Some(error) => Some(error.to_string()),
            None if !self.sources.contains_key(&dataset) => {
                Some(format!("no {} feed configured", dataset.label()))
            }
            None if fetched.items.is_empty() => {
                Some(format!("no {} data fetched", dataset.label()))
            }
            None => None,
        };
        let report = RunReport {
            dataset,
            started_at,
            ended_at: Utc::now(),
            counts: RunCounts {
                fetched: fetched.items.len() as u64,
                inserted: inserted as u64,
                dropped,
            },
            error,
            fetch_seconds: Some(fetched.fetch_seconds),
        };
        self.runs.record(&report).await;

        match &report.error {
            None => info!(
                pages = fetched.pages,
                fetched = report.counts.fetched,
                inserted = report.counts.inserted,
                dropped = report.counts.dropped,
                "run succeeded"
            ),
            Some(error) => warn!(
                pages = fetched.pages,
                fetched = report.counts.fetched,
                inserted = report.counts.inserted,
                %error,
                "run failed"
            ),
        }

        RunOutcome {
            run_id,
            pages: fetched.pages,
            report,
        }
    }
}

/// Cron-driven auto runs. Ticks that arrive while a previous one is still running are skipped.
pub async fn build_watch_scheduler(
    orchestrator: Arc<Orchestrator>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let orchestrator = Arc::clone(&orchestrator);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Ok(_tick) = in_flight.try_lock() else {
                warn!("previous watch tick still running; skipping");
                return;
            };
            let report = orchestrator.run(RunMode::Auto).await;
            info!(
                completed = report.completed().count(),
                succeeded = report.all_succeeded(),
                "watch tick finished"
            );
        })
    })
    .with_context(|| format!("creating watch job for cron {cron}"))?;
    sched.add(job).await.context("adding watch job")?;
    Ok(sched)
}

/// Run once immediately, then on `config.watch_cron` until Ctrl-C.
pub async fn watch(orchestrator: Arc<Orchestrator>, config: &IngestConfig) -> Result<()> {
    let mut sched = build_watch_scheduler(Arc::clone(&orchestrator), &config.watch_cron).await?;
    orchestrator.run(RunMode::Auto).await;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.watch_cron, "watching feeds; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutting down watch scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use metfeed_storage::FetchError;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    type Script = Vec<Result<FeedPage, u16>>;

    /// Replays a fixed list of pages; `Err(status)` pages fail with that HTTP status.
    struct ScriptedSource {
        dataset: Dataset,
        pages: Script,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedSource {
        fn boxed(dataset: Dataset, pages: Script) -> (Box<dyn FeedSource>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let source = Self {
                dataset,
                pages,
                calls: Arc::clone(&calls),
            };
            (Box::new(source), calls)
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedSource {
        fn dataset(&self) -> Dataset {
            self.dataset
        }

        async fn fetch_page(&self, page: u32) -> Result<FeedPage, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.pages.get(page as usize - 1) {
                Some(Ok(fetched)) => Ok(fetched.clone()),
                Some(Err(status)) => Err(FeedError::Transport(FetchError::HttpStatus {
                    status: *status,
                    url: format!("https://feed.test/{}?page={page}", self.dataset),
                })),
                None => Err(FeedError::MalformedBody {
                    dataset: self.dataset,
                    message: format!("page {page} requested past end of script"),
                }),
            }
        }
    }

    fn forecast_page(ids: &[i64], current_page: Option<u32>, page_count: Option<u32>) -> FeedPage {
        FeedPage {
            items: ids
                .iter()
                .map(|id| json!({"forecastid": id, "synopsis": format!("forecast {id}")}))
                .collect(),
            current_page,
            page_count,
            body: format!("{ids:?}").into_bytes(),
            extension: "json",
        }
    }

    fn alert_page(titles: &[&str]) -> FeedPage {
        FeedPage {
            items: titles
                .iter()
                .map(|title| json!({"title": title, "pub_date": "Mon, 01 Sep 2025 10:00:00 GMT"}))
                .collect(),
            current_page: None,
            page_count: None,
            body: b"<rss/>".to_vec(),
            extension: "xml",
        }
    }

    async fn open_db(dir: &TempDir) -> (IngestConfig, Database) {
        let config = IngestConfig {
            db_path: dir.path().join("weather.db"),
            ..IngestConfig::default()
        };
        let db = Database::open(&config.db_path).await.expect("open db");
        db.migrate().await.expect("migrate");
        (config, db)
    }

    async fn orchestrator(dir: &TempDir, sources: Vec<Box<dyn FeedSource>>) -> Orchestrator {
        let (config, db) = open_db(dir).await;
        sources
            .into_iter()
            .fold(Orchestrator::new(&config, db), Orchestrator::with_source)
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).single().unwrap()
    }

    fn success_at(dataset: Dataset, started_at: DateTime<Utc>, error: Option<&str>) -> RunReport {
        RunReport {
            dataset,
            started_at,
            ended_at: started_at + chrono::Duration::seconds(2),
            counts: RunCounts::default(),
            error: error.map(str::to_string),
            fetch_seconds: None,
        }
    }

    fn completed(report: &InvocationReport, dataset: Dataset) -> &RunOutcome {
        report
            .completed()
            .find(|run| run.report.dataset == dataset)
            .expect("dataset completed")
    }

    #[tokio::test]
    async fn staleness_gate_uses_per_dataset_thresholds() {
        let dir = tempdir().expect("tempdir");
        let (config, db) = open_db(&dir).await;
        let runs = db.run_logger();
        let scheduler = Scheduler::new(runs.clone(), config.thresholds);

        assert!(scheduler.is_due(Dataset::Alerts, base()).await, "cold start");
        assert!(scheduler.is_due(Dataset::Forecasts, base()).await, "cold start");

        runs.record(&success_at(Dataset::Alerts, base(), None)).await;
        runs.record(&success_at(Dataset::Forecasts, base(), None)).await;

        let minutes = |m| base() + chrono::Duration::minutes(m);
        assert!(!scheduler.is_due(Dataset::Alerts, minutes(9)).await);
        assert!(scheduler.is_due(Dataset::Alerts, minutes(10)).await);
        assert!(!scheduler.is_due(Dataset::Forecasts, minutes(59)).await);
        assert!(scheduler.is_due(Dataset::Forecasts, minutes(60)).await);
    }

    #[tokio::test]
    async fn failed_runs_do_not_reset_the_clock() {
        let dir = tempdir().expect("tempdir");
        let (config, db) = open_db(&dir).await;
        let runs = db.run_logger();
        let scheduler = Scheduler::new(runs.clone(), config.thresholds);

        runs.record(&success_at(Dataset::Alerts, base(), None)).await;
        let later = base() + chrono::Duration::minutes(8);
        runs.record(&success_at(Dataset::Alerts, later, Some("http status 503"))).await;

        assert!(scheduler.is_due(Dataset::Alerts, base() + chrono::Duration::minutes(10)).await);
    }

    #[tokio::test]
    async fn scheduler_fails_open_when_run_log_is_unreachable() {
        let dir = tempdir().expect("tempdir");
        let (config, db) = open_db(&dir).await;
        let scheduler = Scheduler::new(db.run_logger(), config.thresholds);
        db.run_logger()
            .record(&success_at(Dataset::Alerts, base(), None))
            .await;
        db.close().await;
        assert!(scheduler.is_due(Dataset::Alerts, base()).await);
    }

    #[tokio::test]
    async fn pagination_follows_metadata_to_the_last_page() {
        let (source, calls) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![
                Ok(forecast_page(&[1, 2], Some(1), Some(3))),
                Ok(forecast_page(&[3, 4], Some(2), Some(3))),
                Ok(forecast_page(&[5], Some(3), Some(3))),
                Ok(forecast_page(&[99], Some(4), Some(3))),
            ],
        );
        let outcome = fetch_to_completion(source.as_ref(), None, base()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.pages, 3);
        assert!(outcome.error.is_none());
        let ids = outcome
            .items
            .iter()
            .map(|item| item["forecastid"].as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn pagination_stops_without_metadata() {
        let (source, calls) =
            ScriptedSource::boxed(Dataset::Alerts, vec![Ok(alert_page(&["Flood Watch"]))]);
        let outcome = fetch_to_completion(source.as_ref(), None, base()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.items.len(), 1);
    }

    #[tokio::test]
    async fn pagination_uses_requested_page_when_current_page_is_missing() {
        let (source, calls) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![
                Ok(forecast_page(&[1], None, Some(3))),
                Ok(forecast_page(&[2], None, Some(3))),
                Ok(forecast_page(&[3], None, Some(3))),
                Ok(forecast_page(&[99], None, Some(3))),
            ],
        );
        let outcome = fetch_to_completion(source.as_ref(), None, base()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.pages, 3);
        let ids = outcome
            .items
            .iter()
            .map(|item| item["forecastid"].as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pagination_stops_when_provider_never_advances() {
        let stuck = forecast_page(&[1], Some(1), Some(2));
        let (source, calls) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![Ok(stuck.clone()), Ok(stuck.clone()), Ok(stuck)],
        );
        let outcome = fetch_to_completion(source.as_ref(), None, base()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.items.len(), 2);
    }

    #[tokio::test]
    async fn page_error_keeps_earlier_items() {
        let (source, calls) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![Ok(forecast_page(&[1, 2], Some(1), Some(3))), Err(503)],
        );
        let outcome = fetch_to_completion(source.as_ref(), None, base()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.pages, 1);
        assert!(matches!(outcome.error, Some(FeedError::Transport(_))));
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_to_its_dataset() {
        let dir = tempdir().expect("tempdir");
        let (alerts, _) = ScriptedSource::boxed(Dataset::Alerts, vec![Err(502)]);
        let (forecasts, _) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![Ok(forecast_page(&[10, 11], Some(1), Some(1)))],
        );
        let orchestrator = orchestrator(&dir, vec![alerts, forecasts]).await;

        let report = orchestrator.run(RunMode::All).await;
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].dataset(), Dataset::Alerts);
        assert!(!report.all_succeeded());

        let alerts = completed(&report, Dataset::Alerts);
        assert!(!alerts.report.success());
        assert_eq!(alerts.report.counts.inserted, 0);
        assert!(alerts.report.error.as_deref().unwrap_or_default().contains("502"));

        let forecasts = completed(&report, Dataset::Forecasts);
        assert!(forecasts.report.success());
        assert_eq!(forecasts.report.counts.inserted, 2);

        let runs = orchestrator.database().run_logger().recent(10).await.expect("runs");
        assert_eq!(runs.len(), 2);
        let failed = runs.iter().find(|r| r.run_type == Dataset::Alerts).expect("alert row");
        assert!(!failed.success);
        assert_eq!(failed.inserted_count, 0);
        assert!(failed.error_message.is_some());
    }

    #[tokio::test]
    async fn auto_mode_skips_fresh_datasets_without_logging() {
        let dir = tempdir().expect("tempdir");
        let (alerts, alert_calls) = ScriptedSource::boxed(
            Dataset::Alerts,
            vec![Ok(alert_page(&["Yellow Level Flood Alert"]))],
        );
        let (forecasts, _) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![Ok(forecast_page(&[1], None, None))],
        );
        let orchestrator = orchestrator(&dir, vec![alerts, forecasts]).await;

        let first = orchestrator.run(RunMode::Auto).await;
        assert_eq!(first.completed().count(), 2);
        assert!(first.all_succeeded());

        let second = orchestrator.run(RunMode::Auto).await;
        assert_eq!(
            second.outcomes,
            vec![
                DatasetOutcome::Skipped { dataset: Dataset::Alerts },
                DatasetOutcome::Skipped { dataset: Dataset::Forecasts },
            ]
        );
        assert_eq!(alert_calls.load(Ordering::SeqCst), 1);

        let runs = orchestrator.database().run_logger().recent(10).await.expect("runs");
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn forced_modes_bypass_the_gate_and_stay_idempotent() {
        let dir = tempdir().expect("tempdir");
        let (forecasts, calls) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![Ok(forecast_page(&[7, 8], Some(1), Some(1)))],
        );
        let orchestrator = orchestrator(&dir, vec![forecasts]).await;

        let first = orchestrator.run(RunMode::Forecasts).await;
        let second = orchestrator.run(RunMode::Forecasts).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(completed(&first, Dataset::Forecasts).report.counts.inserted, 2);
        let repeat = completed(&second, Dataset::Forecasts);
        assert!(repeat.report.success());
        assert_eq!(repeat.report.counts.fetched, 2);
        assert_eq!(repeat.report.counts.inserted, 0);
        assert_eq!(second.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn mid_pagination_error_persists_partial_data() {
        let dir = tempdir().expect("tempdir");
        let (forecasts, _) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![Ok(forecast_page(&[1, 2, 3], Some(1), Some(4))), Err(503)],
        );
        let orchestrator = orchestrator(&dir, vec![forecasts]).await;

        let report = orchestrator.run(RunMode::Forecasts).await;
        let run = completed(&report, Dataset::Forecasts);
        assert!(!run.report.success());
        assert_eq!(run.pages, 1);
        assert_eq!(run.report.counts.fetched, 3);
        assert_eq!(run.report.counts.inserted, 3);
        assert!(run.report.error.as_deref().unwrap_or_default().contains("503"));

        let store = orchestrator.database().dedup_store();
        assert_eq!(store.count(Dataset::Forecasts).await.expect("count"), 3);
        let logged = orchestrator
            .database()
            .run_logger()
            .recent(1)
            .await
            .expect("runs");
        assert_eq!(logged[0].inserted_count, 3);
        assert_eq!(logged[0].total_rows_after, Some(3));
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_and_counted() {
        let dir = tempdir().expect("tempdir");
        let mut page = forecast_page(&[1, 2], None, None);
        page.items.push(json!({"synopsis": "missing id"}));
        let (forecasts, _) = ScriptedSource::boxed(Dataset::Forecasts, vec![Ok(page)]);
        let orchestrator = orchestrator(&dir, vec![forecasts]).await;

        let report = orchestrator.run(RunMode::Forecasts).await;
        let run = completed(&report, Dataset::Forecasts);
        assert!(run.report.success());
        assert_eq!(run.report.counts.fetched, 3);
        assert_eq!(run.report.counts.inserted, 2);
        assert_eq!(run.report.counts.dropped, 1);
    }

    #[tokio::test]
    async fn empty_fetch_is_logged_as_failure() {
        let dir = tempdir().expect("tempdir");
        let (alerts, _) = ScriptedSource::boxed(Dataset::Alerts, vec![Ok(alert_page(&[]))]);
        let orchestrator = orchestrator(&dir, vec![alerts]).await;

        let report = orchestrator.run(RunMode::Alerts).await;
        let run = completed(&report, Dataset::Alerts);
        assert_eq!(run.report.error.as_deref(), Some("no alert data fetched"));

        let runs = orchestrator.database().run_logger();
        assert!(runs.last_success(Dataset::Alerts).await.expect("query").is_none());
        assert_eq!(runs.recent(10).await.expect("runs").len(), 1);
    }

    #[tokio::test]
    async fn missing_feed_still_logs_the_started_run() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator(&dir, Vec::new()).await;
        let report = orchestrator.run(RunMode::Alerts).await;
        let run = completed(&report, Dataset::Alerts);
        assert_eq!(run.report.error.as_deref(), Some("no alert feed configured"));
        assert_eq!(orchestrator.stats().await.total_runs, 1);
    }

    #[tokio::test]
    async fn archive_dir_receives_raw_pages() {
        let dir = tempdir().expect("tempdir");
        let (mut config, db) = open_db(&dir).await;
        config.archive_dir = Some(dir.path().join("raw"));
        let (forecasts, _) = ScriptedSource::boxed(
            Dataset::Forecasts,
            vec![
                Ok(forecast_page(&[1], Some(1), Some(2))),
                Ok(forecast_page(&[2], Some(2), Some(2))),
            ],
        );
        let orchestrator = Orchestrator::new(&config, db).with_source(forecasts);
        orchestrator.run(RunMode::Forecasts).await;

        let mut stamp_dirs = std::fs::read_dir(dir.path().join("raw")).expect("archive root");
        let stamp = stamp_dirs.next().expect("stamp dir").expect("entry").path();
        let mut pages = std::fs::read_dir(stamp.join("forecasts"))
            .expect("dataset dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        pages.sort();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].starts_with("page-0001-") && pages[0].ends_with(".json"));
        assert!(pages[1].starts_with("page-0002-") && pages[1].ends_with(".json"));
    }

    #[test]
    fn run_modes_select_datasets_in_order() {
        assert_eq!(RunMode::Alerts.datasets(), &[Dataset::Alerts]);
        assert_eq!(RunMode::Forecasts.datasets(), &[Dataset::Forecasts]);
        assert_eq!(RunMode::All.datasets(), &[Dataset::Alerts, Dataset::Forecasts]);
        assert_eq!(RunMode::Auto.datasets(), RunMode::All.datasets());
        assert!(RunMode::All.is_forced());
        assert!(!RunMode::Auto.is_forced());
    }

    #[test]
    fn config_reads_prefixed_vars_with_defaults() {
        let config = IngestConfig::from_vars(|key| match key {
            "METFEED_DB_PATH" => Some("/tmp/metfeed.db".to_string()),
            "METFEED_HTTP_TIMEOUT_SECS" => Some("not-a-number".to_string()),
            "METFEED_ARCHIVE_DIR" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.db_path, PathBuf::from("/tmp/metfeed.db"));
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.archive_dir, None);
        assert_eq!(config.alerts_url, DEFAULT_ALERTS_URL);
        assert_eq!(config.thresholds, ThresholdTable::default());
        assert_eq!(config.thresholds.threshold(Dataset::Alerts), chrono::Duration::minutes(10));
    }

    #[test]
    fn yaml_overlay_replaces_only_present_keys() {
        let mut config = IngestConfig::default();
        let overlay: ConfigOverlay = serde_yaml::from_str(
            "forecasts_url: https://example.test/forecasts\n\
             http_timeout_secs: 30\n\
             archive_dir: ./raw\n",
        )
        .expect("overlay");
        config.apply_overlay(overlay);
        assert_eq!(config.forecasts_url, "https://example.test/forecasts");
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.archive_dir, Some(PathBuf::from("./raw")));
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));

        assert!(serde_yaml::from_str::<ConfigOverlay>("thresholds: 5\n").is_err());
    }

    #[tokio::test]
    async fn load_reads_yaml_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("metfeed.yaml");
        std::fs::write(&path, "watch_cron: \"0 */5 * * * *\"\n").expect("write config");
        let config = IngestConfig::load(Some(path.as_path())).await.expect("load");
        assert_eq!(config.watch_cron, "0 */5 * * * *");

        assert!(IngestConfig::load(Some(dir.path().join("missing.yaml").as_path())).await.is_err());
    }
}
