//! Sync pipeline: fan-out fetch + extract per export file, sequential dedup reduce, reports.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use amis_adapters::{
    file_source_for, parse_export, recognized_files, CoopExportHarvester, FileSource,
    FileSourceKind, ParsedExport, SourceFile, SupplyTarget, DEFAULT_DOWNLOAD_PAGE,
};
use amis_core::TransactionRecord;
use amis_storage::{ExportArchive, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod aggregate;
pub mod cache;
pub mod reports;

pub use aggregate::{aggregate, DedupAggregator};
pub use cache::{CachedRecords, RecordProvider, StaticRecords, TtlCache};
pub use reports::{report_daily_markdown, ParquetManifest, ParquetManifestFile, RunMeta};

pub const CRATE_NAME: &str = "amis-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: FileSourceKind,
    /// Listing URL or directory, depending on `kind`.
    pub location: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub harvest_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_concurrency: usize,
    /// Requests per second across all sources; `None` disables the token bucket.
    pub rate_limit_per_sec: Option<u32>,
    pub cache_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("./artifacts"),
            workspace_root: PathBuf::from("."),
            scheduler_enabled: false,
            sync_cron: "0 30 6 * * *".to_string(),
            harvest_cron: "0 0 6 * * *".to_string(),
            user_agent: "amis-sync/0.1".to_string(),
            http_timeout_secs: 20,
            http_concurrency: 8,
            rate_limit_per_sec: None,
            cache_ttl_secs: 300,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            artifacts_dir: std::env::var("AMIS_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            workspace_root: std::env::var("AMIS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            scheduler_enabled: env_flag("AMIS_SCHEDULER_ENABLED"),
            sync_cron: env_or("AMIS_SYNC_CRON", &defaults.sync_cron),
            harvest_cron: env_or("AMIS_HARVEST_CRON", &defaults.harvest_cron),
            user_agent: env_or("AMIS_USER_AGENT", &defaults.user_agent),
            http_timeout_secs: env_parse("AMIS_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_concurrency: env_parse("AMIS_HTTP_CONCURRENCY", defaults.http_concurrency),
            rate_limit_per_sec: std::env::var("AMIS_RATE_LIMIT_PER_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0),
            cache_ttl_secs: env_parse("AMIS_CACHE_TTL_SECS", defaults.cache_ttl_secs),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.http_concurrency,
            token_bucket: self.rate_limit_per_sec.map(|per_sec| TokenBucketConfig {
                capacity: per_sec,
                refill_every: Duration::from_secs(1) / per_sec.max(1),
            }),
            ..Default::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectStats {
    pub enabled_sources: usize,
    pub failed_sources: usize,
    pub files: usize,
    pub failed_files: usize,
    pub extracted_records: usize,
    pub skipped_blocks: usize,
    pub duplicates: usize,
}

/// What one export file contributed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub source_id: String,
    pub file_name: String,
    pub extracted: usize,
    pub kept: usize,
    pub skipped: usize,
    pub archived_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Collected {
    /// Deduplicated, in display order.
    pub records: Vec<TransactionRecord>,
    pub stats: CollectStats,
    pub files: Vec<FileReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: CollectStats,
    pub unique_records: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

struct FileOutcome {
    report: FileReport,
    records: Vec<TransactionRecord>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    archive: ExportArchive,
    http: Arc<HttpFetcher>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_http(config, Arc::new(http)))
    }

    pub fn with_http(config: SyncConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            archive: ExportArchive::new(config.artifacts_dir.clone()),
            config,
            http,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.registry_path()).await
    }

    /// Fetch and extract every recognized file of every enabled source, then
    /// dedup in file-list order. Only a missing registry is an error; source
    /// and file failures are logged and contribute nothing.
    pub async fn collect(&self) -> Result<Collected> {
        let registry = self.load_source_registry().await?;
        let fetched_at = Utc::now();
        let mut stats = CollectStats::default();
        let mut tasks = JoinSet::new();
        let mut slots: Vec<Option<FileOutcome>> = Vec::new();

        for source_config in registry.enabled() {
            stats.enabled_sources += 1;
            let source = file_source_for(
                &source_config.source_id,
                source_config.kind,
                &source_config.location,
            );
            let files = match source.list_files(&self.http).await {
                Ok(files) => recognized_files(files),
                Err(err) => {
                    stats.failed_sources += 1;
                    warn!(source_id = %source_config.source_id, error = %err, "listing failed; source skipped");
                    continue;
                }
            };
            debug!(source_id = %source_config.source_id, files = files.len(), "listed source");

            for file in files {
                let index = slots.len();
                slots.push(None);
                let source = Arc::clone(&source);
                let http = Arc::clone(&self.http);
                let archive = self.archive.clone();
                tasks.spawn(async move {
                    let outcome = process_file(source, http, archive, fetched_at, file).await;
                    (index, outcome)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(err) => warn!(error = %err, "file task aborted"),
            }
        }

        let mut aggregator = DedupAggregator::new();
        let mut files = Vec::with_capacity(slots.len());
        for outcome in slots.into_iter().flatten() {
            let mut report = outcome.report;
            stats.files += 1;
            if report.error.is_some() {
                stats.failed_files += 1;
            }
            stats.extracted_records += report.extracted;
            stats.skipped_blocks += report.skipped;
            report.kept = aggregator.extend(outcome.records);
            files.push(report);
        }
        stats.duplicates = aggregator.duplicates();
        let records = aggregator.finish();

        info!(
            sources = stats.enabled_sources,
            files = stats.files,
            failed_files = stats.failed_files,
            records = records.len(),
            duplicates = stats.duplicates,
            "collected records"
        );
        Ok(Collected {
            records,
            stats,
            files,
        })
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let collected = self.collect().await?;
        let finished_at = Utc::now();

        let run = RunMeta {
            run_id,
            started_at,
            finished_at,
        };
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        reports::write_reports(
            &reports_dir,
            &run,
            &collected.stats,
            &collected.files,
            &collected.records,
        )
        .await?;
        let manifest_path = reports::export_parquet_snapshot(&reports_dir, &collected.records).await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            unique_records: collected.records.len(),
            stats: collected.stats,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }
}

async fn process_file(
    source: Arc<dyn FileSource>,
    http: Arc<HttpFetcher>,
    archive: ExportArchive,
    fetched_at: DateTime<Utc>,
    file: SourceFile,
) -> FileOutcome {
    let span = info_span!("process_file", source_id = %source.source_id(), file = %file.name);
    async move {
        let mut report = FileReport {
            source_id: source.source_id().to_string(),
            file_name: file.name.clone(),
            extracted: 0,
            kept: 0,
            skipped: 0,
            archived_path: None,
            error: None,
        };

        let bytes = match source.fetch_file(&http, &file).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "fetch failed; file contributes no records");
                report.error = Some(err.to_string());
                return FileOutcome {
                    report,
                    records: Vec::new(),
                };
            }
        };

        match archive
            .store_export(fetched_at, source.source_id(), &file.name, &bytes)
            .await
        {
            Ok(archived) => {
                report.archived_path = Some(archived.relative_path.display().to_string())
            }
            Err(err) => warn!(error = %format!("{err:#}"), "archiving export failed"),
        }

        let ParsedExport {
            records,
            skipped,
            had_replacements,
        } = parse_export(&bytes);
        if had_replacements {
            debug!("export contained undecodable bytes");
        }
        report.extracted = records.len();
        report.skipped = skipped;
        debug!(records = records.len(), skipped, "extracted export");
        FileOutcome { report, records }
    }
    .instrument(span)
    .await
}

/// Live pipeline output as a dashboard record source.
pub struct PipelineRecords {
    pipeline: SyncPipeline,
}

impl PipelineRecords {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl RecordProvider for PipelineRecords {
    async fn load(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.pipeline.collect().await?.records)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub source_id: String,
    pub page_url: String,
    pub supply_no: String,
    pub data_dir: PathBuf,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            source_id: "afa-portal".to_string(),
            page_url: env_or("AMIS_PORTAL_URL", DEFAULT_DOWNLOAD_PAGE),
            supply_no: env_or("AMIS_SUPPLY_NO", "A00013"),
            data_dir: std::env::var("AMIS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        }
    }
}

/// Download one day's export from the portal into the data directory.
pub async fn harvest_once(
    harvest: &HarvestConfig,
    http: &HttpFetcher,
    date: NaiveDate,
) -> Result<PathBuf> {
    let harvester = CoopExportHarvester::new(
        harvest.source_id.clone(),
        harvest.page_url.clone(),
        SupplyTarget::new(harvest.supply_no.clone()),
    );
    let export = harvester
        .harvest(http, date, date)
        .await
        .with_context(|| format!("harvesting export for {date}"))?;

    fs::create_dir_all(&harvest.data_dir)
        .await
        .with_context(|| format!("creating {}", harvest.data_dir.display()))?;
    let path = harvest.data_dir.join(&export.file_name);
    fs::write(&path, &export.body)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = export.body.len(), "saved harvested export");
    Ok(path)
}

pub async fn harvest_once_from_env(date: Option<NaiveDate>) -> Result<PathBuf> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    harvest_with_config(&SyncConfig::from_env(), &HarvestConfig::from_env(), date).await
}

async fn harvest_with_config(
    config: &SyncConfig,
    harvest: &HarvestConfig,
    date: NaiveDate,
) -> Result<PathBuf> {
    let http = HttpFetcher::new(config.http_client_config())?;
    harvest_once(harvest, &http, date).await
}

async fn sync_with_config(config: SyncConfig) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once().await
}

/// Cron jobs for harvest and sync, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: SyncConfig,
    harvest: HarvestConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let harvest_config = config.clone();
    let harvest_job = Job::new_async(config.harvest_cron.as_str(), move |_uuid, _l| {
        let config = harvest_config.clone();
        let harvest = harvest.clone();
        Box::pin(async move {
            let today = Local::now().date_naive();
            if let Err(err) = harvest_with_config(&config, &harvest, today).await {
                warn!(error = %format!("{err:#}"), "scheduled harvest failed");
            }
        })
    })
    .with_context(|| format!("creating harvest job for cron {}", config.harvest_cron))?;
    sched.add(harvest_job).await.context("adding harvest job")?;

    let sync_config = config.clone();
    let sync_job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = sync_config.clone();
        Box::pin(async move {
            match sync_with_config(config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    records = summary.unique_records,
                    "scheduled sync finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {}", config.sync_cron))?;
    sched.add(sync_job).await.context("adding sync job")?;

    Ok(Some(sched))
}
