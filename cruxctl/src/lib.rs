use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use crux_media::{load_media_config, MediaConfig, SqliteJournalStore};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] crux_media::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("journal error: {0}")]
    Journal(#[from] crux_media::JournalError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Crux media upload control interface", long_about = None)]
pub struct Cli {
    /// Path to the main media.toml
    #[arg(long, default_value = "configs/media.toml")]
    pub config: PathBuf,
    /// Override for the data directory (replaces paths.data_dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternate path for journal.sqlite
    #[arg(long)]
    pub journal_db: Option<PathBuf>,
    /// Token for local authentication (when CRUXCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Shows a summary of the upload pipeline state
    Status,
    /// Inspects upload jobs recorded in the journal
    #[command(subcommand)]
    Jobs(JobCommands),
    /// Maintenance operations on the journal database
    #[command(subcommand)]
    Journal(JournalCommands),
    /// Runs integrity checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Lists recorded upload jobs
    List(JobListArgs),
    /// Shows one upload session in full
    Show(JobShowArgs),
}

#[derive(Args, Debug)]
pub struct JobListArgs {
    /// Filter by a specific status
    #[arg(long)]
    pub status: Option<String>,
    /// Maximum number of rows returned
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct JobShowArgs {
    /// Upload session identifier
    pub session_id: String,
}

#[derive(Subcommand, Debug)]
pub enum JournalCommands {
    /// Deletes finished rows from the journal
    Purge,
    /// Writes a gzip-compressed SQL dump of the journal
    Export(JournalExportArgs),
    /// Copies the journal through the sqlite backup API
    Backup(JournalBackupArgs),
}

#[derive(Args, Debug)]
pub struct JournalExportArgs {
    /// Destination file (defaults to journal-export.sql.gz in the data dir)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct JournalBackupArgs {
    /// Destination file (defaults to journal-backup.sqlite in the data dir)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Runs basic checks
    Check,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Jobs(JobCommands::List(args)) => {
            let jobs = context.jobs_list(args)?;
            render(&jobs, cli.format)?;
        }
        Commands::Jobs(JobCommands::Show(args)) => {
            let detail = context.jobs_show(args)?;
            render(&detail, cli.format)?;
        }
        Commands::Journal(JournalCommands::Purge) => {
            let result = context.journal_purge()?;
            render(&result, cli.format)?;
        }
        Commands::Journal(JournalCommands::Export(args)) => {
            let result = context.journal_export(args)?;
            render(&result, cli.format)?;
        }
        Commands::Journal(JournalCommands::Backup(args)) => {
            let result = context.journal_backup(args)?;
            render(&result, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check()?;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("CRUXCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: MediaConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
    journal_db: PathBuf,
    staging_dir: PathBuf,
    logs_dir: PathBuf,
    failure_log: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_media_config(&config_path)?;

        let default_data = PathBuf::from(&config.paths.data_dir);
        let data_dir = cli.data_dir.clone().unwrap_or(default_data);
        let journal_db = cli
            .journal_db
            .clone()
            .unwrap_or_else(|| data_dir.join("journal.sqlite"));
        let staging_dir = config.staging_dir();
        let logs_dir = PathBuf::from(&config.paths.logs_dir);
        let failure_log = config.failure_log_path();

        Ok(Self {
            config,
            config_path,
            data_dir,
            journal_db,
            staging_dir,
            logs_dir,
            failure_log,
        })
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let endpoints = EndpointSummary {
            upload_url: self.config.endpoints.upload_url.clone(),
            catalog_url: self.config.endpoints.catalog_url.clone(),
        };

        let journal_counts = self.journal_counts().unwrap_or_default();
        let failures = self.failure_log_summary()?;

        Ok(StatusReport {
            endpoints,
            admission_slots: self.config.limits.max_active_jobs,
            journal_counts,
            failures,
        })
    }

    fn jobs_list(&self, args: &JobListArgs) -> Result<JobList> {
        let conn = self.open_database(&self.journal_db)?;
        let mut stmt = conn.prepare(
            "SELECT session_id, target_id, file_name, file_size, kind, status, progress, \
                    retry_count, error, updated_at \
             FROM upload_journal \
             WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY updated_at DESC NULLS LAST, started_at DESC \
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map((args.status.as_ref(), args.limit as i64), |row| {
                Ok(JobEntry {
                    session_id: row.get(0)?,
                    target_id: row.get(1)?,
                    file_name: row.get(2)?,
                    file_size: row.get(3)?,
                    kind: row.get(4)?,
                    status: row.get(5)?,
                    progress: row.get(6)?,
                    retry_count: row.get(7)?,
                    error: row.get::<_, Option<String>>(8)?,
                    updated_at: row.get::<_, Option<String>>(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(JobList { rows })
    }

    fn jobs_show(&self, args: &JobShowArgs) -> Result<JobDetail> {
        let conn = self.open_database(&self.journal_db)?;
        let mut stmt = conn.prepare(
            "SELECT session_id, target_id, file_name, file_size, kind, status, progress, \
                    error, variant_urls, retry_count, file_hash, diagnostics, \
                    started_at, completed_at, updated_at \
             FROM upload_journal WHERE session_id = ?1",
        )?;
        let detail = stmt
            .query_row([&args.session_id], |row| {
                let variant_urls: Option<String> = row.get(8)?;
                let diagnostics: Option<String> = row.get(11)?;
                Ok(JobDetail {
                    session_id: row.get(0)?,
                    target_id: row.get(1)?,
                    file_name: row.get(2)?,
                    file_size: row.get(3)?,
                    kind: row.get(4)?,
                    status: row.get(5)?,
                    progress: row.get(6)?,
                    error: row.get::<_, Option<String>>(7)?,
                    variant_urls: variant_urls
                        .as_deref()
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or_default(),
                    retry_count: row.get(9)?,
                    file_hash: row.get::<_, Option<String>>(10)?,
                    diagnostics: diagnostics
                        .as_deref()
                        .and_then(|raw| serde_json::from_str(raw).ok()),
                    started_at: row.get::<_, Option<String>>(12)?,
                    completed_at: row.get::<_, Option<String>>(13)?,
                    updated_at: row.get::<_, Option<String>>(14)?,
                })
            })
            .optional()?;

        detail.ok_or_else(|| {
            AppError::MissingResource(format!("upload session not found: {}", args.session_id))
        })
    }

    fn journal_purge(&self) -> Result<PurgeResult> {
        let store = SqliteJournalStore::builder()
            .path(&self.journal_db)
            .create_if_missing(false)
            .build()?;
        let removed = store.purge_terminal()?;
        Ok(PurgeResult { removed })
    }

    fn journal_export(&self, args: &JournalExportArgs) -> Result<ExportResult> {
        let output = args
            .output
            .clone()
            .unwrap_or_else(|| self.data_dir.join("journal-export.sql.gz"));
        let store = SqliteJournalStore::builder()
            .path(&self.journal_db)
            .read_only(true)
            .build()?;
        store.export_dump(&output)?;
        Ok(ExportResult {
            output: output.display().to_string(),
        })
    }

    fn journal_backup(&self, args: &JournalBackupArgs) -> Result<BackupResult> {
        let output = args
            .output
            .clone()
            .unwrap_or_else(|| self.data_dir.join("journal-backup.sqlite"));
        let store = SqliteJournalStore::builder()
            .path(&self.journal_db)
            .read_only(true)
            .build()?;
        store.backup_to(&output)?;
        Ok(BackupResult {
            output: output.display().to_string(),
        })
    }

    fn health_check(&self) -> Result<Vec<HealthEntry>> {
        let mut results = Vec::new();
        results.push(self.check_path("media.toml", &self.config_path));
        results.push(self.check_database("journal.sqlite", &self.journal_db));
        results.push(self.check_directory("data", &self.data_dir));
        results.push(self.check_directory("staging", &self.staging_dir));
        results.push(self.check_directory("logs", &self.logs_dir));
        results.push(self.check_log_file("failure log", &self.failure_log));
        Ok(results)
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{path} not found", path = path.display()));
        }
        match self.open_database(path) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("open failed: {err}")),
        }
    }

    // Absence is the healthy state here; the file only appears after a
    // job has failed.
    fn check_log_file(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::ok(name, "no failures recorded".to_string())
        }
    }

    fn open_database(&self, path: &Path) -> Result<Connection> {
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "database missing: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(conn)
    }

    fn journal_counts(&self) -> Option<HashMap<String, i64>> {
        let conn = self.open_database(&self.journal_db).ok()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM upload_journal GROUP BY status")
            .ok()?;
        let mut map = HashMap::new();
        for row in stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .ok()?
        {
            if let Ok((status, count)) = row {
                map.insert(status, count);
            }
        }
        Some(map)
    }

    fn failure_log_summary(&self) -> Result<Option<FailureLogSummary>> {
        if !self.failure_log.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.failure_log)?;
        let mut entries = 0usize;
        let mut last = None;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries += 1;
            last = Some(line.to_string());
        }
        Ok(Some(FailureLogSummary { entries, last }))
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub endpoints: EndpointSummary,
    pub admission_slots: usize,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub journal_counts: HashMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<FailureLogSummary>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Upload endpoint: {}", self.endpoints.upload_url),
            format!("Catalog endpoint: {}", self.endpoints.catalog_url),
            format!("Admission slots: {}", self.admission_slots),
        ];
        if !self.journal_counts.is_empty() {
            lines.push("Journal:".to_string());
            for (status, count) in self.journal_counts.iter() {
                lines.push(format!("  - {status}: {count}"));
            }
        }
        match &self.failures {
            Some(summary) => {
                lines.push(format!("Failures logged: {}", summary.entries));
                if let Some(last) = &summary.last {
                    lines.push(format!("  last: {last}"));
                }
            }
            None => lines.push("Failures logged: none".to_string()),
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct EndpointSummary {
    pub upload_url: String,
    pub catalog_url: String,
}

#[derive(Debug, Serialize)]
pub struct FailureLogSummary {
    pub entries: usize,
    pub last: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub rows: Vec<JobEntry>,
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No upload jobs found".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let target = entry.target_id.as_deref().unwrap_or("-");
            lines.push(format!(
                "{} | {} | kind={} | status={} | {}% | retries={} | target={}",
                entry.session_id,
                entry.file_name,
                entry.kind,
                entry.status,
                entry.progress,
                entry.retry_count,
                target
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct JobEntry {
    pub session_id: String,
    pub target_id: Option<String>,
    pub file_name: String,
    pub file_size: i64,
    pub kind: String,
    pub status: String,
    pub progress: i64,
    pub retry_count: i64,
    pub error: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    pub session_id: String,
    pub target_id: Option<String>,
    pub file_name: String,
    pub file_size: i64,
    pub kind: String,
    pub status: String,
    pub progress: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variant_urls: BTreeMap<String, String>,
    pub retry_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: Option<String>,
}

impl DisplayFallback for JobDetail {
    fn display(&self) -> String {
        let mut lines = vec![format!("Session: {} ({})", self.session_id, self.kind)];
        lines.push(format!(
            "Target: {}",
            self.target_id.as_deref().unwrap_or("standalone")
        ));
        lines.push(format!("File: {} ({} bytes)", self.file_name, self.file_size));
        lines.push(format!(
            "Status: {} at {}% (retries: {})",
            self.status, self.progress, self.retry_count
        ));
        if let Some(error) = &self.error {
            lines.push(format!("Error: {error}"));
        }
        if !self.variant_urls.is_empty() {
            lines.push("Variants:".to_string());
            for (variant, url) in &self.variant_urls {
                lines.push(format!("  - {variant}: {url}"));
            }
        }
        if let Some(hash) = &self.file_hash {
            lines.push(format!("Hash: {hash}"));
        }
        if let Some(diagnostics) = &self.diagnostics {
            lines.push(format!("Diagnostics: {diagnostics}"));
        }
        let started = self.started_at.as_deref().unwrap_or("-");
        let completed = self.completed_at.as_deref().unwrap_or("-");
        let updated = self.updated_at.as_deref().unwrap_or("-");
        lines.push(format!(
            "Timeline: started {started} / completed {completed} / updated {updated}"
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PurgeResult {
    pub removed: usize,
}

impl DisplayFallback for PurgeResult {
    fn display(&self) -> String {
        format!("{} finished journal rows removed", self.removed)
    }
}

#[derive(Debug, Serialize)]
pub struct ExportResult {
    pub output: String,
}

impl DisplayFallback for ExportResult {
    fn display(&self) -> String {
        format!("Journal exported to {}", self.output)
    }
}

#[derive(Debug, Serialize)]
pub struct BackupResult {
    pub output: String,
}

impl DisplayFallback for BackupResult {
    fn display(&self) -> String {
        format!("Journal backed up to {}", self.output)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crux_media::{JobStatus, MediaKind, UploadRecord};
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/media.toml", configs_dir.join("media.toml")).unwrap();

        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let journal_db = data_dir.join("journal.sqlite");

        let store = SqliteJournalStore::new(&journal_db).unwrap();
        store.initialize().unwrap();

        let mut completed = UploadRecord::new("up-done", "send.mp4", 2048, MediaKind::Video);
        completed.status = JobStatus::Completed;
        completed.progress = 100;
        for variant in ["hd", "sd", "low"] {
            completed.variant_urls.insert(
                variant.to_string(),
                format!("https://cdn.test/up-done:{variant}"),
            );
        }
        completed.diagnostics = Some(serde_json::json!({"network": "wifi", "app": "2.4.1"}));
        store.upsert(&completed).unwrap();

        let mut uploading = UploadRecord::new("up-live", "arete.mp4", 4096, MediaKind::Video);
        uploading.status = JobStatus::Uploading;
        uploading.progress = 40;
        store.upsert(&uploading).unwrap();

        let cli = Cli {
            config: configs_dir.join("media.toml"),
            data_dir: Some(data_dir.clone()),
            journal_db: Some(journal_db.clone()),
            token: None,
            format: OutputFormat::Json,
            command: Commands::Status,
        };

        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn status_report_counts_journal_rows() {
        let (_temp, context) = prepare_test_context().unwrap();
        let status = context.gather_status().unwrap();
        assert_eq!(status.admission_slots, 4);
        assert_eq!(status.journal_counts.get("completed"), Some(&1));
        assert_eq!(status.journal_counts.get("uploading"), Some(&1));
        assert!(status.failures.is_none());
    }

    #[test]
    fn job_listing_filters_by_status() {
        let (_temp, context) = prepare_test_context().unwrap();
        let all = context
            .jobs_list(&JobListArgs {
                status: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(all.rows.len(), 2);

        let completed = context
            .jobs_list(&JobListArgs {
                status: Some("completed".to_string()),
                limit: 10,
            })
            .unwrap();
        assert_eq!(completed.rows.len(), 1);
        assert_eq!(completed.rows[0].session_id, "up-done");
        assert_eq!(completed.rows[0].progress, 100);
    }

    #[test]
    fn job_show_returns_full_detail() {
        let (_temp, context) = prepare_test_context().unwrap();
        let detail = context
            .jobs_show(&JobShowArgs {
                session_id: "up-done".to_string(),
            })
            .unwrap();
        assert_eq!(detail.file_name, "send.mp4");
        assert_eq!(detail.variant_urls.len(), 3);
        assert!(detail.variant_urls["hd"].contains("up-done"));
        assert_eq!(
            detail
                .diagnostics
                .as_ref()
                .and_then(|value| value.get("network"))
                .and_then(|value| value.as_str()),
            Some("wifi")
        );

        let missing = context.jobs_show(&JobShowArgs {
            session_id: "up-unknown".to_string(),
        });
        assert!(matches!(missing, Err(AppError::MissingResource(_))));
    }

    #[test]
    fn health_check_passes_on_seeded_layout() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.health_check().unwrap();
        let journal = report
            .iter()
            .find(|entry| entry.name == "journal.sqlite")
            .unwrap();
        assert!(matches!(journal.status, CheckStatus::Ok));
        assert!(!report
            .iter()
            .any(|entry| matches!(entry.status, CheckStatus::Error)));
    }
}
