//! Upload job orchestration.
//!
//! The manager owns the full pipeline for one media upload: admission,
//! duplicate probing, compression, chunked transfer, catalog commit and
//! the durable journal record that survives restarts. Jobs run as
//! spawned tasks; callers observe them through watch channels.

mod error;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EndpointsSection, MediaConfig};
use crate::dedup::{fingerprint, DuplicatePolicy};
use crate::journal::{
    JobStatus, MediaKind, SqliteJournalStore, UploadRecord, CANCELLED_BY_USER, REMOVED_BY_USER,
};
use crate::progress::{composite_percent, StageProgress};
use crate::scheduler::AdmissionScheduler;
use crate::transcode::{
    FfmpegTranscoder, SourceMedia, TranscodeError, VariantTranscoder,
};
use crate::transfer::{
    ChunkTransport, ChunkedTransferClient, HttpChunkTransport, TransferError, TransferTask,
};

pub use error::{UploadError, UploadResult};
pub use types::{JobSnapshot, UploadContext};

const SESSION_PREFIX: &str = "up";
const USER_AGENT: &str = "CruxMedia/1.0";

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CommitError(pub String);

/// Publishes finished variant URLs to the catalog entry they belong to.
/// The write must be a single atomic update on the remote side.
#[async_trait]
pub trait CatalogCommitter: Send + Sync {
    async fn commit(
        &self,
        target_id: &str,
        primary_url: &str,
        variant_urls: &BTreeMap<String, String>,
        context: &UploadContext,
    ) -> Result<(), CommitError>;
}

pub struct HttpCatalogCommitter {
    client: Client,
    catalog_url: String,
}

impl HttpCatalogCommitter {
    pub fn new(client: Client, endpoints: &EndpointsSection) -> Self {
        Self {
            client,
            catalog_url: endpoints.catalog_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CatalogCommitter for HttpCatalogCommitter {
    async fn commit(
        &self,
        target_id: &str,
        primary_url: &str,
        variant_urls: &BTreeMap<String, String>,
        context: &UploadContext,
    ) -> Result<(), CommitError> {
        let url = format!("{}/{}", self.catalog_url, target_id);
        let payload = serde_json::json!({
            "media_url": primary_url,
            "media_variants": variant_urls,
        });
        let mut request = self.client.patch(&url).json(&payload);
        if let Some(token) = &context.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|error| CommitError(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommitError(format!(
                "catalog returned {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok(())
    }
}

struct JobEntry {
    record: UploadRecord,
    context: UploadContext,
    source: Option<SourceMedia>,
    stage: StageProgress,
    cancel: CancellationToken,
    events: watch::Sender<JobSnapshot>,
}

impl JobEntry {
    fn new(record: UploadRecord, context: UploadContext, source: Option<SourceMedia>) -> Self {
        let stage = StageProgress::new(record.kind.required_variants().len());
        let (events, _) = watch::channel(JobSnapshot::from_record(&record));
        Self {
            record,
            context,
            source,
            stage,
            cancel: CancellationToken::new(),
            events,
        }
    }
}

/// Coordinates upload jobs end to end. Cloning is cheap; clones share
/// the same scheduler, job table and journal.
#[derive(Clone)]
pub struct UploadJobManager {
    journal: SqliteJournalStore,
    config: Arc<MediaConfig>,
    scheduler: Arc<AdmissionScheduler>,
    duplicates: DuplicatePolicy,
    transcoder: Arc<dyn VariantTranscoder>,
    transfer: Arc<ChunkedTransferClient>,
    committer: Arc<dyn CatalogCommitter>,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    log_path: PathBuf,
}

impl UploadJobManager {
    pub fn new(journal: SqliteJournalStore, config: MediaConfig) -> UploadResult<Self> {
        journal.initialize()?;
        let config = Arc::new(config);
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| UploadError::Transfer(TransferError::Network(error.to_string())))?;
        let transcoder = FfmpegTranscoder::new(
            config.transcode.clone(),
            config.profiles.clone(),
            config.staging_dir(),
        );
        let transport = HttpChunkTransport::new(client.clone(), &config.endpoints);
        let transfer = ChunkedTransferClient::new(
            Arc::new(transport),
            &config.transfer,
            &config.retry,
        );
        let committer = HttpCatalogCommitter::new(client, &config.endpoints);
        let log_path = config.failure_log_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::journal::JournalError::Io)?;
        }
        Ok(Self {
            journal,
            scheduler: Arc::new(AdmissionScheduler::new(config.limits.max_active_jobs)),
            duplicates: DuplicatePolicy::new(&config.dedup),
            transcoder: Arc::new(transcoder),
            transfer: Arc::new(transfer),
            committer: Arc::new(committer),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            log_path,
            config,
        })
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn VariantTranscoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChunkTransport>) -> Self {
        self.transfer = Arc::new(ChunkedTransferClient::new(
            transport,
            &self.config.transfer,
            &self.config.retry,
        ));
        self
    }

    pub fn with_committer(mut self, committer: Arc<dyn CatalogCommitter>) -> Self {
        self.committer = committer;
        self
    }

    /// Registers a new upload and returns its session id. The journal row
    /// is written before the job becomes visible; the pipeline itself runs
    /// on a spawned task once an admission slot is free.
    pub fn submit(
        &self,
        source: SourceMedia,
        kind: MediaKind,
        target_id: Option<String>,
        context: UploadContext,
    ) -> UploadResult<String> {
        if source.bytes.is_empty() {
            return Err(UploadError::EmptySource);
        }
        let session_id = format!("{SESSION_PREFIX}-{}", Uuid::new_v4().simple());
        let mut record = UploadRecord::new(
            &session_id,
            &source.file_name,
            source.bytes.len() as i64,
            kind,
        );
        record.target_id = target_id;
        record.diagnostics = context.diagnostics.clone();
        self.journal.upsert(&record)?;

        let entry = JobEntry::new(record, context, Some(source));
        self.jobs
            .lock()
            .unwrap()
            .insert(session_id.clone(), entry);
        info!(session = %session_id, kind = %kind, "upload job submitted");
        self.admit_or_queue(&session_id);
        Ok(session_id)
    }

    /// Requests cooperative cancellation. Queued jobs are cancelled on the
    /// spot; running jobs stop at their next suspension point. Terminal
    /// jobs are left alone.
    pub fn cancel(&self, session_id: &str) -> UploadResult<()> {
        enum Path {
            Noop,
            Direct,
            Signal(CancellationToken),
        }
        let path = {
            let jobs = self.jobs.lock().unwrap();
            let entry = jobs
                .get(session_id)
                .ok_or_else(|| UploadError::UnknownSession {
                    session_id: session_id.to_string(),
                })?;
            match entry.record.status {
                status if status.terminal() => Path::Noop,
                JobStatus::Restoring => Path::Direct,
                JobStatus::Pending if self.scheduler.remove_pending(session_id) => Path::Direct,
                _ => Path::Signal(entry.cancel.clone()),
            }
        };
        match path {
            Path::Noop => {}
            Path::Direct => {
                self.update_entry(session_id, |entry| {
                    entry.record.status = JobStatus::Cancelled;
                    entry.record.error = Some(CANCELLED_BY_USER.to_string());
                    entry.source = None;
                })?;
                info!(session = %session_id, "upload cancelled before start");
            }
            Path::Signal(token) => {
                token.cancel();
                debug!(session = %session_id, "cancellation requested");
            }
        }
        Ok(())
    }

    /// Attaches a freshly re-picked source to a restored job and queues it
    /// for another run. Only jobs in `restoring` can be resumed.
    pub fn resume(&self, session_id: &str, source: SourceMedia) -> UploadResult<()> {
        if source.bytes.is_empty() {
            return Err(UploadError::EmptySource);
        }
        {
            let mut jobs = self.jobs.lock().unwrap();
            let entry = jobs
                .get_mut(session_id)
                .ok_or_else(|| UploadError::UnknownSession {
                    session_id: session_id.to_string(),
                })?;
            if entry.record.status != JobStatus::Restoring {
                return Err(UploadError::InvalidStatus {
                    session_id: session_id.to_string(),
                    status: entry.record.status.to_string(),
                });
            }
            entry.record.status = JobStatus::Pending;
            entry.record.progress = 0;
            entry.record.error = None;
            entry.record.retry_count = 0;
            entry.record.file_name = source.file_name.clone();
            entry.record.file_size = source.bytes.len() as i64;
            entry.stage = StageProgress::new(entry.record.kind.required_variants().len());
            entry.source = Some(source);
            entry.cancel = CancellationToken::new();
        }
        self.update_entry(session_id, |_| {})?;
        info!(session = %session_id, "restored upload resumed");
        self.admit_or_queue(session_id);
        Ok(())
    }

    /// Removes a terminal or restored job and deletes its journal row. The
    /// row is stamped with the removal sentinel before deletion so a crash
    /// in between cannot bring the job back on the next restore sweep.
    pub fn dismiss(&self, session_id: &str) -> UploadResult<()> {
        let in_memory = {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(session_id) {
                Some(entry) => {
                    let status = entry.record.status;
                    if !status.terminal() && status != JobStatus::Restoring {
                        return Err(UploadError::InvalidStatus {
                            session_id: session_id.to_string(),
                            status: status.to_string(),
                        });
                    }
                    entry.record.error = Some(REMOVED_BY_USER.to_string());
                    self.journal.upsert(&entry.record)?;
                    true
                }
                None => false,
            }
        };
        if !in_memory {
            let mut record = self
                .journal
                .fetch(session_id)?
                .ok_or_else(|| UploadError::UnknownSession {
                    session_id: session_id.to_string(),
                })?;
            if !record.status.terminal() && record.status != JobStatus::Restoring {
                return Err(UploadError::InvalidStatus {
                    session_id: session_id.to_string(),
                    status: record.status.to_string(),
                });
            }
            record.error = Some(REMOVED_BY_USER.to_string());
            self.journal.upsert(&record)?;
        }
        self.journal.delete(session_id)?;
        self.scheduler.remove_pending(session_id);
        self.jobs.lock().unwrap().remove(session_id);
        info!(session = %session_id, "upload job dismissed");
        Ok(())
    }

    /// Loads interrupted jobs from the journal after a restart. Matching
    /// rows are forced into `restoring` and surfaced without a source
    /// payload; the caller re-attaches one through [`resume`].
    ///
    /// [`resume`]: UploadJobManager::resume
    pub fn restore_persisted(&self) -> UploadResult<Vec<JobSnapshot>> {
        let marked = self.journal.mark_all_restoring()?;
        let records = self.journal.list_restoring()?;
        let mut snapshots = Vec::with_capacity(records.len());
        {
            let mut jobs = self.jobs.lock().unwrap();
            for record in records {
                if jobs.contains_key(&record.session_id) {
                    continue;
                }
                let session_id = record.session_id.clone();
                let entry = JobEntry::new(record, UploadContext::default(), None);
                snapshots.push(JobSnapshot::from_record(&entry.record));
                jobs.insert(session_id, entry);
            }
        }
        if marked > 0 {
            info!(count = marked, "interrupted upload jobs await resume");
        }
        let swept = self.transcoder.sweep_stale();
        if swept > 0 {
            info!(count = swept, "stale staging directories removed");
        }
        Ok(snapshots)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(session_id)
            .map(|entry| JobSnapshot::from_record(&entry.record))
    }

    /// All jobs currently held in memory, oldest submission first.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        let mut entries: Vec<_> = jobs.values().collect();
        entries.sort_by(|a, b| {
            a.record
                .started_at
                .cmp(&b.record.started_at)
                .then_with(|| a.record.session_id.cmp(&b.record.session_id))
        });
        entries
            .iter()
            .map(|entry| JobSnapshot::from_record(&entry.record))
            .collect()
    }

    /// Watch channel for one job. Every state change publishes a fresh
    /// snapshot; the channel closes when the job is evicted or dismissed.
    pub fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<JobSnapshot>> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(session_id).map(|entry| entry.events.subscribe())
    }

    pub fn active_count(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn pending_count(&self) -> usize {
        self.scheduler.pending_count()
    }

    fn admit_or_queue(&self, session_id: &str) {
        if self.scheduler.try_admit(session_id) {
            self.spawn_run(session_id.to_string());
        } else {
            self.scheduler.enqueue(session_id);
            debug!(session = %session_id, "admission slots full, queued");
        }
    }

    fn spawn_run(&self, session_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_job(session_id).await;
        });
    }

    async fn run_job(&self, session_id: String) {
        if let Err(error) = self.drive(&session_id).await {
            self.fail_job(&session_id, &error);
        }
        self.finish_job(&session_id);
    }

    async fn drive(&self, session_id: &str) -> UploadResult<()> {
        let (source, context, cancel, kind, file_name, commit_only) = {
            let jobs = self.jobs.lock().unwrap();
            let entry = jobs
                .get(session_id)
                .ok_or_else(|| UploadError::UnknownSession {
                    session_id: session_id.to_string(),
                })?;
            (
                entry.source.clone(),
                entry.context.clone(),
                entry.cancel.clone(),
                entry.record.kind,
                entry.record.file_name.clone(),
                entry.record.has_all_variants(),
            )
        };
        if cancel.is_cancelled() {
            return Err(UploadError::Transfer(TransferError::Cancelled));
        }

        // Every variant already has a URL when only the catalog commit
        // failed last time; skip straight to the commit.
        if commit_only {
            self.update_entry(session_id, |entry| {
                entry.record.status = JobStatus::Uploading;
                entry.stage.compress = 1.0;
                for slot in entry.stage.transfers.iter_mut() {
                    *slot = 1.0;
                }
            })?;
            return self.commit_and_complete(session_id, &context).await;
        }

        let source = source.ok_or_else(|| UploadError::MissingSource {
            session_id: session_id.to_string(),
        })?;

        let hash = fingerprint(&source.bytes);
        self.update_entry(session_id, |entry| {
            entry.record.file_hash = Some(hash.clone());
        })?;
        let probe_record = {
            let jobs = self.jobs.lock().unwrap();
            jobs.get(session_id)
                .map(|entry| entry.record.clone())
                .ok_or_else(|| UploadError::UnknownSession {
                    session_id: session_id.to_string(),
                })?
        };
        if let Some(found) = self.duplicates.probe(&self.journal, &probe_record, &hash)? {
            info!(
                session = %session_id,
                matched = %found.session_id,
                rule = %found.rule,
                "duplicate upload short-circuited"
            );
            self.update_entry(session_id, |entry| {
                entry.record.status = JobStatus::Duplicate;
            })?;
            return Ok(());
        }

        self.update_entry(session_id, |entry| {
            entry.record.status = JobStatus::Compressing;
        })?;
        info!(session = %session_id, "compression started");
        let compress_manager = self.clone();
        let compress_session = session_id.to_string();
        let on_compress = move |fraction: f64| {
            let _ = compress_manager.update_entry(&compress_session, |entry| {
                entry.stage.compress = fraction;
            });
        };
        let variants = self
            .transcoder
            .transcode(session_id, &source, kind, &cancel, &on_compress)
            .await?;

        let expected = kind.required_variants();
        let complete = variants.len() == expected.len()
            && expected
                .iter()
                .all(|name| variants.iter().any(|blob| blob.variant == *name));
        if !complete {
            let produced: Vec<&str> = variants.iter().map(|blob| blob.variant.as_str()).collect();
            return Err(UploadError::Transcode(TranscodeError::Failed(format!(
                "expected variants {expected:?}, produced {produced:?}"
            ))));
        }

        self.update_entry(session_id, |entry| {
            entry.record.status = JobStatus::Uploading;
            entry.stage.compress = 1.0;
        })?;
        info!(session = %session_id, variants = variants.len(), "transfer started");

        let mut uploads = Vec::with_capacity(variants.len());
        for (index, blob) in variants.iter().enumerate() {
            let task = TransferTask {
                session_key: format!("{session_id}:{}", blob.variant),
                file_name: file_name.clone(),
                mime_type: blob.mime_type.clone(),
                bearer_token: context.bearer_token.clone(),
            };
            let progress_manager = self.clone();
            let progress_session = session_id.to_string();
            let retry_manager = self.clone();
            let retry_session = session_id.to_string();
            let client = self.transfer.clone();
            let payload = blob.bytes.clone();
            let cancel = cancel.clone();
            let variant = blob.variant.clone();
            uploads.push(async move {
                let on_progress = move |fraction: f64| {
                    let _ = progress_manager.update_entry(&progress_session, |entry| {
                        if let Some(slot) = entry.stage.transfers.get_mut(index) {
                            *slot = fraction;
                        }
                    });
                };
                let on_retry = move || {
                    let _ = retry_manager.update_entry(&retry_session, |entry| {
                        entry.record.retry_count += 1;
                    });
                };
                let url = client
                    .upload(&task, payload, &cancel, &on_progress, &on_retry)
                    .await?;
                Ok::<(String, String), TransferError>((variant, url))
            });
        }
        let uploaded = futures::future::try_join_all(uploads).await?;

        // URLs land in the journal before the commit so a commit failure
        // can later go commit-only instead of re-uploading everything.
        self.update_entry(session_id, |entry| {
            for (variant, url) in &uploaded {
                entry.record.variant_urls.insert(variant.clone(), url.clone());
            }
            for slot in entry.stage.transfers.iter_mut() {
                *slot = 1.0;
            }
        })?;

        self.commit_and_complete(session_id, &context).await
    }

    async fn commit_and_complete(
        &self,
        session_id: &str,
        context: &UploadContext,
    ) -> UploadResult<()> {
        let (target_id, primary_url, variant_urls) = {
            let jobs = self.jobs.lock().unwrap();
            let entry = jobs
                .get(session_id)
                .ok_or_else(|| UploadError::UnknownSession {
                    session_id: session_id.to_string(),
                })?;
            (
                entry.record.target_id.clone(),
                entry.record.primary_url().map(String::from),
                entry.record.variant_urls.clone(),
            )
        };
        match target_id {
            Some(target_id) => {
                let primary_url = primary_url
                    .ok_or_else(|| UploadError::Commit("no primary variant url".to_string()))?;
                self.committer
                    .commit(&target_id, &primary_url, &variant_urls, context)
                    .await
                    .map_err(|error| UploadError::Commit(error.to_string()))?;
                info!(session = %session_id, target = %target_id, "catalog entry updated");
            }
            None => {
                debug!(session = %session_id, "no catalog target, commit skipped");
            }
        }
        self.update_entry(session_id, |entry| {
            entry.record.status = JobStatus::Completed;
            entry.record.completed_at = Some(Utc::now());
            entry.record.error = None;
            entry.stage.committed = true;
            entry.source = None;
        })?;
        info!(session = %session_id, "upload completed");
        Ok(())
    }

    fn fail_job(&self, session_id: &str, error: &UploadError) {
        if self.cancellation_outcome(session_id, error) {
            info!(session = %session_id, "upload cancelled");
            let _ = self.update_entry(session_id, |entry| {
                entry.record.status = JobStatus::Cancelled;
                entry.record.error = Some(CANCELLED_BY_USER.to_string());
                entry.source = None;
            });
            return;
        }
        warn!(session = %session_id, error = %error, "upload failed");
        self.log_failure(stage_of(error), error);
        let _ = self.update_entry(session_id, |entry| {
            entry.record.status = JobStatus::Failed;
            entry.record.error = Some(error.to_string());
        });
    }

    // A cancel signal can race a real failure from a parallel variant;
    // the user's request wins either way.
    fn cancellation_outcome(&self, session_id: &str, error: &UploadError) -> bool {
        if matches!(
            error,
            UploadError::Transcode(TranscodeError::Cancelled)
                | UploadError::Transfer(TransferError::Cancelled)
        ) {
            return true;
        }
        let jobs = self.jobs.lock().unwrap();
        jobs.get(session_id)
            .map(|entry| entry.cancel.is_cancelled())
            .unwrap_or(false)
    }

    fn finish_job(&self, session_id: &str) {
        let status = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.get_mut(session_id).map(|entry| {
                entry.source = None;
                entry.record.status
            })
        };
        if status == Some(JobStatus::Completed) {
            self.schedule_eviction(session_id.to_string());
        }
        for admitted in self.scheduler.on_job_terminal(session_id) {
            self.spawn_run(admitted);
        }
    }

    // Completed jobs stay visible for a short grace period, then leave
    // memory. Their journal rows remain until the user dismisses them.
    fn schedule_eviction(&self, session_id: String) {
        let manager = self.clone();
        let grace = Duration::from_secs(self.config.limits.completed_grace_seconds);
        tokio::spawn(async move {
            sleep(grace).await;
            let mut jobs = manager.jobs.lock().unwrap();
            if let Some(entry) = jobs.get(&session_id) {
                if entry.record.status == JobStatus::Completed {
                    jobs.remove(&session_id);
                    debug!(session = %session_id, "completed job evicted from memory");
                }
            }
        });
    }

    /// Applies a mutation to one job, clamps progress so it never moves
    /// backwards, persists the record and publishes a fresh snapshot.
    fn update_entry<F>(&self, session_id: &str, mutate: F) -> UploadResult<JobSnapshot>
    where
        F: FnOnce(&mut JobEntry),
    {
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .get_mut(session_id)
            .ok_or_else(|| UploadError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        mutate(entry);
        let computed = composite_percent(&entry.stage);
        if computed > entry.record.progress {
            entry.record.progress = computed;
        }
        entry.record.updated_at = Some(Utc::now());
        if let Err(error) = self.journal.upsert(&entry.record) {
            warn!(session = %session_id, error = %error, "journal write failed");
            return Err(UploadError::Journal(error));
        }
        let snapshot = JobSnapshot::from_record(&entry.record);
        entry.events.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    fn log_failure(&self, stage: &str, error: &UploadError) {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = writeln!(file, "{} [{}] {}", Utc::now().to_rfc3339(), stage, error);
        }
    }
}

fn stage_of(error: &UploadError) -> &'static str {
    match error {
        UploadError::EmptySource
        | UploadError::MissingSource { .. }
        | UploadError::UnknownSession { .. }
        | UploadError::InvalidStatus { .. } => "validate",
        UploadError::Journal(_) => "journal",
        UploadError::Transcode(_) => "compress",
        UploadError::Transfer(_) => "transfer",
        UploadError::Commit(_) => "commit",
    }
}
