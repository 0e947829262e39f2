//! Review ingestion pipeline orchestration.
//!
//! One run: load the dataset, index known review ids, resolve the remote
//! cursor, then fetch/merge/persist/checkpoint the missing ids batch by batch.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tajrobe_core::{
    candidate_ids, dataset_stats, known_review_ids, merge_reviews, partition_batches,
    validate_remote_review, CompanyProfile, DatasetStats, RemoteReview, StorageIdGenerator,
    UuidStorageIds,
};
use tajrobe_source::{
    ApiCompanyCatalog, ApiReviewSource, CompanyCatalog, ReviewSource, DEFAULT_API_BASE_URL,
};
use tajrobe_storage::{
    write_atomic, DatasetStore, HttpClientConfig, HttpFetcher, ProgressCheckpoint, RetryPolicy,
};
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tajrobe-sync";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
pub const COMPANY_CACHE_FILE: &str = "cached-companies.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub companies_api_url: String,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub batch_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            companies_api_url: DEFAULT_API_BASE_URL.to_string(),
            data_dir: PathBuf::from("."),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 30,
            batch_size: 50,
            concurrency: 1,
            batch_delay: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let api_base_url =
            std::env::var("TAJROBE_API_BASE_URL").unwrap_or(defaults.api_base_url);
        Self {
            companies_api_url: std::env::var("TAJROBE_COMPANIES_API_URL")
                .or_else(|_| std::env::var("API_URL"))
                .unwrap_or_else(|_| api_base_url.clone()),
            api_base_url,
            data_dir: std::env::var("TAJROBE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            user_agent: std::env::var("TAJROBE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("TAJROBE_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            batch_size: env_or("TAJROBE_BATCH_SIZE", defaults.batch_size).max(1),
            concurrency: env_or("TAJROBE_CONCURRENCY", defaults.concurrency).max(1),
            batch_delay: Duration::from_millis(env_or("TAJROBE_BATCH_DELAY_MS", 5_000u64)),
            retry: RetryPolicy {
                max_attempts: env_or("TAJROBE_MAX_ATTEMPTS", defaults.retry.max_attempts).max(1),
                base_delay: Duration::from_millis(env_or("TAJROBE_BASE_DELAY_MS", 5_000u64)),
                max_delay: Duration::from_millis(env_or("TAJROBE_MAX_DELAY_MS", 10_000u64)),
                rate_limit_default: Duration::from_secs(env_or(
                    "TAJROBE_RATE_LIMIT_DEFAULT_SECS",
                    5u64,
                )),
            },
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.concurrency,
            retry: self.retry,
        }
    }
}

/// Run-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Loading,
    Indexing,
    ResolvingCursor,
    UpToDate,
    BatchLoop,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Indexing => "indexing",
            Self::ResolvingCursor => "resolving_cursor",
            Self::UpToDate => "up_to_date",
            Self::BatchLoop => "batch_loop",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Fetched,
    /// The source has no review under this id.
    Absent,
    /// Fetch failed after the retry policy gave up; treated as absent for this run.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch_index: usize,
    pub total_batches: usize,
    pub attempted: usize,
    pub fetched: usize,
    pub absent: usize,
    pub failed: usize,
    pub merged: usize,
    pub orphaned: usize,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub up_to_date: bool,
    pub latest_review_id: u64,
    pub known_reviews: usize,
    pub candidates: usize,
    pub batches: usize,
    pub fetched: usize,
    pub merged: usize,
    pub absent: usize,
    pub failed: usize,
    pub orphaned: usize,
    pub backup_path: Option<PathBuf>,
    pub dataset_path: PathBuf,
}

/// Observer for run progress; every hook is optional.
pub trait ProgressReporter: Send + Sync {
    fn state_changed(&self, _state: RunState) {}
    fn run_planned(&self, _candidates: usize, _batches: usize) {}
    fn batch_started(&self, _batch_index: usize, _total_batches: usize, _size: usize) {}
    fn item_finished(&self, _review_id: u64, _outcome: ItemOutcome) {}
    fn batch_finished(&self, _report: &BatchReport) {}
    fn run_finished(&self, _summary: &SyncRunSummary) {}
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {}

/// Reports progress as structured log events.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn state_changed(&self, state: RunState) {
        info!(%state, "sync state");
    }

    fn run_planned(&self, candidates: usize, batches: usize) {
        info!(candidates, batches, "reviews to process");
    }

    fn batch_started(&self, batch_index: usize, total_batches: usize, size: usize) {
        info!(batch = batch_index + 1, total_batches, size, "fetching batch");
    }

    fn item_finished(&self, review_id: u64, outcome: ItemOutcome) {
        debug!(review_id, ?outcome, "review processed");
    }

    fn batch_finished(&self, report: &BatchReport) {
        info!(
            batch = report.batch_index + 1,
            total_batches = report.total_batches,
            fetched = report.fetched,
            merged = report.merged,
            absent = report.absent,
            failed = report.failed,
            orphaned = report.orphaned,
            persisted = report.persisted,
            "batch complete"
        );
    }

    fn run_finished(&self, summary: &SyncRunSummary) {
        info!(
            run_id = %summary.run_id,
            up_to_date = summary.up_to_date,
            merged = summary.merged,
            failed = summary.failed,
            orphaned = summary.orphaned,
            "sync finished"
        );
    }
}

/// `outer: inner: root` rendering of an error and its sources.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

struct StateTracker<'a> {
    state: RunState,
    reporter: &'a dyn ProgressReporter,
}

impl<'a> StateTracker<'a> {
    fn new(reporter: &'a dyn ProgressReporter) -> Self {
        reporter.state_changed(RunState::Loading);
        Self {
            state: RunState::Loading,
            reporter,
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!(from = %self.state, to = %state, "state transition");
        self.state = state;
        self.reporter.state_changed(state);
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: DatasetStore,
    source: Arc<dyn ReviewSource>,
    reporter: Arc<dyn ProgressReporter>,
    storage_ids: Arc<dyn StorageIdGenerator>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Arc<dyn ReviewSource>) -> Self {
        let store = DatasetStore::new(config.data_dir.clone());
        Self {
            config,
            store,
            source,
            reporter: Arc::new(TracingReporter),
            storage_ids: Arc::new(UuidStorageIds),
        }
    }

    /// Pipeline wired to the remote REST API.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let source = Arc::new(ApiReviewSource::new(http, &config.api_base_url));
        Ok(Self::new(config, source))
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_storage_ids(mut self, storage_ids: Arc<dyn StorageIdGenerator>) -> Self {
        self.storage_ids = storage_ids;
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let mut tracker = StateTracker::new(self.reporter.as_ref());
        match self.run_with(&mut tracker).await {
            Ok(summary) => {
                self.reporter.run_finished(&summary);
                Ok(summary)
            }
            Err(err) => {
                error!(state = %tracker.state, error = %format!("{err:#}"), "sync failed; dataset left at its last committed state");
                tracker.enter(RunState::Failed);
                Err(err)
            }
        }
    }

    async fn run_with(&self, tracker: &mut StateTracker<'_>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let dataset_path = self.store.dataset_path();

        let loaded = self
            .store
            .load()
            .await
            .with_context(|| format!("loading dataset {}", dataset_path.display()))?;
        let mut companies = loaded.companies;

        let mut backup_path = None;
        if let Some(raw) = &loaded.raw {
            let backup = self
                .store
                .write_backup(raw, Utc::now())
                .await
                .context("writing dataset backup")?;
            info!(path = %backup.path.display(), sha256 = %backup.sha256, bytes = backup.byte_size, "backup written");
            backup_path = Some(backup.path);
        }

        tracker.enter(RunState::Indexing);
        let known = known_review_ids(&companies);
        info!(companies = companies.len(), known_reviews = known.len(), "dataset indexed");

        tracker.enter(RunState::ResolvingCursor);
        let latest_review_id = self
            .source
            .latest_review_id()
            .await
            .context("resolving latest remote review id")?;
        info!(latest_review_id, "remote cursor resolved");

        let candidates = candidate_ids(latest_review_id, &known);
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            up_to_date: candidates.is_empty(),
            latest_review_id,
            known_reviews: known.len(),
            candidates: candidates.len(),
            batches: 0,
            fetched: 0,
            merged: 0,
            absent: 0,
            failed: 0,
            orphaned: 0,
            backup_path,
            dataset_path,
        };

        if candidates.is_empty() {
            tracker.enter(RunState::UpToDate);
            tracker.enter(RunState::Done);
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let batches = partition_batches(&candidates, self.config.batch_size);
        summary.batches = batches.len();
        self.reporter.run_planned(candidates.len(), batches.len());

        tracker.enter(RunState::BatchLoop);
        let mut processed = 0usize;
        for (batch_index, batch) in batches.iter().enumerate() {
            self.reporter
                .batch_started(batch_index, batches.len(), batch.len());

            let (fetched, mut report) = self.fetch_batch(batch).await;
            report.batch_index = batch_index;
            report.total_batches = batches.len();

            let outcome = merge_reviews(&mut companies, fetched, self.storage_ids.as_ref(), Utc::now());
            report.merged = outcome.merged;
            report.orphaned = outcome.orphaned;
            if outcome.orphaned > 0 {
                warn!(
                    orphaned = outcome.orphaned,
                    company_ids = ?outcome.orphan_company_ids,
                    "dropping reviews whose company is not in the dataset"
                );
            }

            if outcome.merged > 0 {
                self.store.persist(&companies).await.with_context(|| {
                    format!("persisting dataset after batch {}", batch_index + 1)
                })?;
                report.persisted = true;
            }

            processed += batch.len();
            let checkpoint = ProgressCheckpoint {
                last_processed_batch: batch_index,
                total_batches: batches.len(),
                processed_reviews: processed,
                total_reviews: candidates.len(),
                last_update: Utc::now(),
            };
            if let Err(err) = self.store.write_checkpoint(&checkpoint).await {
                warn!(error = %error_chain(&err), "failed to write progress checkpoint");
            }

            summary.fetched += report.fetched;
            summary.merged += report.merged;
            summary.absent += report.absent;
            summary.failed += report.failed;
            summary.orphaned += report.orphaned;
            self.reporter.batch_finished(&report);

            if batch_index + 1 < batches.len() && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        tracker.enter(RunState::Done);
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn fetch_batch(&self, batch: &[u64]) -> (Vec<RemoteReview>, BatchReport) {
        let results: Vec<(Option<RemoteReview>, ItemOutcome)> = stream::iter(batch.iter().copied())
            .map(|review_id| self.fetch_one(review_id))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport {
            attempted: batch.len(),
            ..Default::default()
        };
        let mut fetched = Vec::with_capacity(batch.len());
        for (review, outcome) in results {
            match outcome {
                ItemOutcome::Fetched => report.fetched += 1,
                ItemOutcome::Absent => report.absent += 1,
                ItemOutcome::Failed => report.failed += 1,
            }
            fetched.extend(review);
        }
        (fetched, report)
    }

    async fn fetch_one(&self, review_id: u64) -> (Option<RemoteReview>, ItemOutcome) {
        let (review, outcome) = match self.source.fetch_review(review_id).await {
            Ok(Some(review)) if review.id != review_id => {
                warn!(review_id, served_id = review.id, "source served a different review id; skipping");
                (None, ItemOutcome::Failed)
            }
            Ok(Some(review)) => match validate_remote_review(&review) {
                Ok(()) => (Some(review), ItemOutcome::Fetched),
                Err(err) => {
                    warn!(review_id, error = %err, "rejecting invalid review");
                    (None, ItemOutcome::Failed)
                }
            },
            Ok(None) => (None, ItemOutcome::Absent),
            Err(err) => {
                warn!(review_id, error = %error_chain(&err), "failed to fetch review; skipping");
                (None, ItemOutcome::Failed)
            }
        };
        self.reporter.item_finished(review_id, outcome);
        (review, outcome)
    }
}

pub async fn run_sync_once(
    config: SyncConfig,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<SyncRunSummary> {
    SyncPipeline::from_config(config)?
        .with_reporter(reporter)
        .run_once()
        .await
}

/// Read-only dataset totals; never writes a backup.
pub async fn dataset_report(data_dir: impl Into<PathBuf>) -> Result<DatasetStats> {
    let store = DatasetStore::new(data_dir);
    let loaded = store
        .load()
        .await
        .with_context(|| format!("loading dataset {}", store.dataset_path().display()))?;
    Ok(dataset_stats(&loaded.companies))
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyCacheSummary {
    pub pages: u32,
    pub companies: usize,
    pub path: PathBuf,
}

/// Page through the company catalog, rewriting `target` after every page.
pub async fn cache_companies(
    catalog: &dyn CompanyCatalog,
    target: &Path,
) -> Result<CompanyCacheSummary> {
    if !fs::try_exists(target)
        .await
        .with_context(|| format!("checking {}", target.display()))?
    {
        write_atomic(target, b"[]")
            .await
            .with_context(|| format!("initializing {}", target.display()))?;
    }

    let mut companies: Vec<CompanyProfile> = Vec::new();
    let mut page = 1u32;
    loop {
        let fetched = catalog
            .fetch_company_page(page)
            .await
            .with_context(|| format!("fetching company page {page}"))?;
        info!(page, total_pages = fetched.total_pages, count = fetched.companies.len(), "company page fetched");
        companies.extend(fetched.companies);

        let bytes = serde_json::to_vec_pretty(&companies).context("serializing company cache")?;
        write_atomic(target, &bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))?;

        if page >= fetched.total_pages {
            break;
        }
        page += 1;
    }

    Ok(CompanyCacheSummary {
        pages: page,
        companies: companies.len(),
        path: target.to_path_buf(),
    })
}

pub async fn cache_companies_from_config(config: &SyncConfig) -> Result<CompanyCacheSummary> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let catalog = ApiCompanyCatalog::new(http, &config.companies_api_url);
    cache_companies(&catalog, &config.data_dir.join(COMPANY_CACHE_FILE)).await
}
