//! Seed-and-sync: reconcile a desired campaign list with the record store and local PDFs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cspec_core::{
    is_seed_filename, spec_slug, CampaignRecord, CampaignUpsert, DesiredRecord, StatusPolicy,
};
use cspec_storage::{
    DatabaseConfig, HttpClientConfig, HttpFetcher, PdfStore, PgRecordStore,
    RecordStore, SpecFetcher, StoreError,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cspec-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub pdf_dir: PathBuf,
    pub seed_file: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub status_policy: StatusPolicy,
    pub reuse_existing_downloads: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").unwrap_or(defaults.url),
                max_connections: env_parse("CSPEC_DB_MAX_CONNECTIONS")
                    .unwrap_or(defaults.max_connections),
                acquire_timeout: env_parse("CSPEC_DB_ACQUIRE_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.acquire_timeout),
            },
            pdf_dir: std::env::var("CSPEC_PDF_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./static")),
            seed_file: std::env::var("CSPEC_SEED_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("campaigns.yaml")),
            reports_dir: std::env::var("CSPEC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            user_agent: std::env::var("CSPEC_USER_AGENT")
                .unwrap_or_else(|_| "cspec-seed/0.1".to_string()),
            http_timeout_secs: env_parse("CSPEC_HTTP_TIMEOUT_SECS").unwrap_or(20),
            status_policy: std::env::var("CSPEC_STATUS_ALLOWLIST")
                .map(|list| StatusPolicy::from_list(&list))
                .unwrap_or_default(),
            reuse_existing_downloads: std::env::var("CSPEC_REUSE_DOWNLOADS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    pub campaigns: Vec<DesiredRecord>,
}

pub async fn load_seed_file(path: &Path) -> Result<Vec<DesiredRecord>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: SeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.campaigns)
}

/// Hands out PDF filenames for one run.
///
/// A campaign keeps the seed filename it already owns in the store. Otherwise it gets its
/// slug, or the first free numeric suffix (`-2`, `-3`, ...) when the slug is issued earlier
/// in this run or owned by another campaign. The same store state and input list always
/// yield the same names.
#[derive(Debug, Default)]
pub struct FilenameAllocator {
    issued: HashSet<String>,
    owners: HashMap<String, CampaignKey>,
    owned: HashMap<CampaignKey, String>,
}

type CampaignKey = (String, String);

impl FilenameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve every filename the stored rows already point at. Lowest id wins on duplicates.
    pub fn with_existing<'a>(rows: impl IntoIterator<Item = &'a CampaignRecord>) -> Self {
        let mut allocator = Self::new();
        for row in rows {
            let Some(filename) = row.pdf_filename.as_deref() else {
                continue;
            };
            let key = (row.name.clone(), row.client.clone());
            allocator
                .owners
                .entry(filename.to_string())
                .or_insert_with(|| key.clone());
            if is_seed_filename(filename) {
                allocator
                    .owned
                    .entry(key)
                    .or_insert_with(|| filename.to_string());
            }
        }
        allocator
    }

    pub fn allocate(&mut self, name: &str, client: &str) -> String {
        let key = (name.to_string(), client.to_string());
        if let Some(own) = self.owned.get(&key) {
            if self.owners.get(own) == Some(&key) && !self.issued.contains(own) {
                let own = own.clone();
                self.issued.insert(own.clone());
                return own;
            }
        }

        let slug = spec_slug(name);
        let mut stem = slug.clone();
        let mut suffix = 2u32;
        loop {
            let candidate = format!("{stem}.pdf");
            let taken = self.issued.contains(&candidate)
                || self.owners.get(&candidate).is_some_and(|owner| *owner != key);
            if !taken {
                self.issued.insert(candidate.clone());
                return candidate;
            }
            stem = format!("{slug}-{suffix}");
            suffix += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub name: String,
    pub client: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    /// Records written to the store (`created + updated`).
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub downloads_succeeded: usize,
    pub downloads_failed: usize,
    pub downloads_reused: usize,
    pub interrupted: bool,
    pub failures: Vec<RecordFailure>,
}

impl SeedSummary {
    fn new(total: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            total,
            processed: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            downloads_succeeded: 0,
            downloads_failed: 0,
            downloads_reused: 0,
            interrupted: false,
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, record: &CampaignUpsert, kind: FailureKind, reason: String) {
        self.failures.push(RecordFailure {
            name: record.name.clone(),
            client: record.client.clone(),
            kind,
            reason,
        });
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("seeding aborted: {0}")]
    StorageUnavailable(#[source] StoreError),
    #[error("preparing pdf directory {}: {source}", .path.display())]
    PdfDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub status_policy: StatusPolicy,
    pub reuse_existing_downloads: bool,
}

pub struct SeedSynchronizer {
    store: Arc<dyn RecordStore>,
    fetcher: Arc<dyn SpecFetcher>,
    pdfs: PdfStore,
    options: SyncOptions,
    stop: Arc<AtomicBool>,
}

impl SeedSynchronizer {
    pub fn new(store: Arc<dyn RecordStore>, fetcher: Arc<dyn SpecFetcher>, pdfs: PdfStore) -> Self {
        Self {
            store,
            fetcher,
            pdfs,
            options: SyncOptions::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Raising this flag ends the run before the next record; finished records stay committed.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub async fn run(&self, desired: &[DesiredRecord]) -> Result<SeedSummary, SyncError> {
        let mut summary = SeedSummary::new(desired.len());

        self.store
            .ensure_schema()
            .await
            .map_err(SyncError::StorageUnavailable)?;
        self.pdfs
            .ensure_dir()
            .await
            .map_err(|source| SyncError::PdfDirectory {
                path: self.pdfs.root().to_path_buf(),
                source,
            })?;

        let existing: Vec<CampaignRecord> = self
            .store
            .list_all()
            .try_collect()
            .await
            .map_err(SyncError::StorageUnavailable)?;
        let mut filenames = FilenameAllocator::with_existing(&existing);
        for (index, entry) in desired.iter().enumerate() {
            if self.stop.load(Ordering::Relaxed) {
                warn!(remaining = desired.len() - index, "seed run interrupted");
                summary.interrupted = true;
                break;
            }
            let span = info_span!("seed_record", index, name = %entry.name.trim());
            self.seed_one(entry, &mut filenames, &mut summary)
                .instrument(span)
                .await?;
        }

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            downloads_succeeded = summary.downloads_succeeded,
            downloads_failed = summary.downloads_failed,
            "seed run finished"
        );
        Ok(summary)
    }

    async fn seed_one(
        &self,
        entry: &DesiredRecord,
        filenames: &mut FilenameAllocator,
        summary: &mut SeedSummary,
    ) -> Result<(), SyncError> {
        let mut record = CampaignUpsert::from_desired(entry, None);
        if let Err(err) = record
            .validate()
            .and_then(|()| self.options.status_policy.check(&record.status))
        {
            warn!(reason = %err, "skipping invalid campaign");
            summary.skipped += 1;
            summary.fail(&record, FailureKind::Validation, err.to_string());
            return Ok(());
        }

        if let Some(url) = entry.spec_url() {
            let filename = filenames.allocate(&record.name, &record.client);
            record.pdf_filename = self.obtain_pdf(url, filename, &record, summary).await;
        }

        match self.store.upsert(&record).await {
            Ok(outcome) => {
                summary.processed += 1;
                if outcome.created {
                    summary.created += 1;
                } else {
                    summary.updated += 1;
                }
                Ok(())
            }
            Err(StoreError::Validation(err)) => {
                warn!(reason = %err, "store rejected campaign");
                summary.skipped += 1;
                summary.fail(&record, FailureKind::Validation, err.to_string());
                Ok(())
            }
            Err(err) => Err(SyncError::StorageUnavailable(err)),
        }
    }

    /// The filename to record for this campaign, or `None` when no PDF could be stored.
    async fn obtain_pdf(
        &self,
        url: &str,
        filename: String,
        record: &CampaignUpsert,
        summary: &mut SeedSummary,
    ) -> Option<String> {
        let Some(destination) = self.pdfs.resolve(&filename) else {
            summary.downloads_failed += 1;
            summary.fail(record, FailureKind::Fetch, format!("unusable filename {filename}"));
            return None;
        };

        if self.options.reuse_existing_downloads && self.pdfs.exists(&filename).await {
            info!(%filename, "reusing existing spec pdf");
            summary.downloads_reused += 1;
            return Some(filename);
        }

        match self.fetcher.fetch(url, &destination).await {
            Ok(bytes) => {
                info!(%filename, bytes, "spec pdf downloaded");
                summary.downloads_succeeded += 1;
                Some(filename)
            }
            Err(err) => {
                warn!(error = %err, "spec pdf download failed");
                summary.downloads_failed += 1;
                summary.fail(record, FailureKind::Fetch, err.to_string());
                None
            }
        }
    }
}

/// Raise a stop flag on Ctrl-C so a running seed finishes the current record and stops.
pub fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current campaign");
            flag.store(true, Ordering::Relaxed);
        }
    });
    stop
}

pub async fn write_summary_report(reports_dir: &Path, summary: &SeedSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("seed_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing seed summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct SeedRun {
    pub summary: SeedSummary,
    pub report_path: PathBuf,
}

/// Seed PostgreSQL from the configured seed file, downloading PDFs over HTTP.
pub async fn run_seed(config: &SyncConfig, stop: Arc<AtomicBool>) -> Result<SeedRun> {
    let desired = load_seed_file(&config.seed_file).await?;
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let store = Arc::new(
        PgRecordStore::connect(&config.database)
            .await
            .context("connecting to the campaign database")?,
    );

    let synchronizer = SeedSynchronizer::new(
        store.clone(),
        Arc::new(fetcher),
        PdfStore::new(config.pdf_dir.clone()),
    )
    .with_options(SyncOptions {
        status_policy: config.status_policy.clone(),
        reuse_existing_downloads: config.reuse_existing_downloads,
    })
    .with_stop_flag(stop);

    let result = synchronizer.run(&desired).await;
    store.close().await;
    let summary = result?;

    let report_path = write_summary_report(&config.reports_dir, &summary).await?;
    Ok(SeedRun {
        summary,
        report_path,
    })
}
