use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

use super::error::{JournalError, JournalResult};
use super::models::{JobStatus, UploadRecord, CANCELLED_BY_USER, REMOVED_BY_USER};

const JOURNAL_SCHEMA: &str = include_str!("../../../sql/journal.sql");

// CURRENT_TIMESTAMP writes space-separated UTC; timestamp parameters use
// the same format so string comparisons in SQL stay sound.
const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.naive_utc().format(SQL_TIMESTAMP_FORMAT).to_string())
}

#[derive(Debug, Clone)]
pub struct SqliteJournalStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteJournalStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteJournalStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> JournalResult<SqliteJournalStore> {
        let path = self.path.ok_or(JournalError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteJournalStore { path, flags })
    }
}

#[derive(Debug, Default, Clone)]
pub struct JournalFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SqliteJournalStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteJournalStore {
    pub fn builder() -> SqliteJournalStoreBuilder {
        SqliteJournalStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> JournalResult<Self> {
        SqliteJournalStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> JournalResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            JournalError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| JournalError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> JournalResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(JOURNAL_SCHEMA)?;
        Ok(())
    }

    /// Idempotent write keyed on session_id. The in-memory record is the
    /// source of truth; every mutation lands here before it is trusted.
    pub fn upsert(&self, record: &UploadRecord) -> JournalResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO upload_journal (
                session_id, target_id, file_name, file_size, kind, status, progress,
                error, variant_urls, retry_count, file_hash, diagnostics,
                started_at, completed_at, updated_at
            ) VALUES (
                :session_id, :target_id, :file_name, :file_size, :kind, :status, :progress,
                :error, :variant_urls, :retry_count, :file_hash, :diagnostics,
                :started_at, :completed_at, CURRENT_TIMESTAMP
            )
            ON CONFLICT(session_id) DO UPDATE SET
                target_id = excluded.target_id,
                file_name = excluded.file_name,
                file_size = excluded.file_size,
                kind = excluded.kind,
                status = excluded.status,
                progress = excluded.progress,
                error = excluded.error,
                variant_urls = excluded.variant_urls,
                retry_count = excluded.retry_count,
                file_hash = excluded.file_hash,
                diagnostics = excluded.diagnostics,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &record.session_id,
                &record.target_id,
                &record.file_name,
                record.file_size,
                record.kind.as_str(),
                record.status.as_str(),
                record.progress as i64,
                &record.error,
                record.serialize_variants(),
                record.retry_count,
                &record.file_hash,
                record.serialize_diagnostics(),
                format_timestamp(record.started_at),
                format_timestamp(record.completed_at),
            ],
        )?;
        Ok(())
    }

    pub fn fetch(&self, session_id: &str) -> JournalResult<Option<UploadRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM upload_journal WHERE session_id = ?1")?;
        let record = stmt
            .query_row([session_id], |row| UploadRecord::from_row(row))
            .optional()?;
        Ok(record)
    }

    pub fn delete(&self, session_id: &str) -> JournalResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM upload_journal WHERE session_id = ?1",
            [session_id],
        )?;
        if affected == 0 {
            return Err(JournalError::NotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn list(&self, filter: &JournalFilter) -> JournalResult<Vec<UploadRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_journal
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY (updated_at IS NULL) ASC, updated_at DESC, started_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                (
                    filter.status.as_ref().map(JobStatus::as_str),
                    filter.limit.map(|limit| limit as i64).unwrap_or(-1),
                ),
                |row| UploadRecord::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn counts_by_status(&self) -> JournalResult<HashMap<String, usize>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM upload_journal GROUP BY status")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (status, count) = row?;
            map.insert(status, count as usize);
        }
        Ok(map)
    }

    /// Crash-recovery sweep: every interrupted or retriable record flips
    /// to restoring in one statement. Records carrying a user sentinel in
    /// the error field are left alone.
    pub fn mark_all_restoring(&self) -> JournalResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE upload_journal
             SET status = 'restoring', updated_at = CURRENT_TIMESTAMP
             WHERE status IN ('pending', 'compressing', 'uploading', 'failed', 'restoring')
               AND (error IS NULL OR error NOT IN (?1, ?2))",
            params![CANCELLED_BY_USER, REMOVED_BY_USER],
        )?;
        Ok(affected)
    }

    pub fn list_restoring(&self) -> JournalResult<Vec<UploadRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_journal
             WHERE status = 'restoring'
             ORDER BY (started_at IS NULL) ASC, started_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| UploadRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// First completed record with the given content hash since the
    /// cutoff, excluding the probing session itself.
    pub fn completed_with_hash_since(
        &self,
        file_hash: &str,
        cutoff: DateTime<Utc>,
        exclude_session: &str,
    ) -> JournalResult<Option<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT session_id FROM upload_journal
             WHERE file_hash = ?1
               AND status = 'completed'
               AND completed_at IS NOT NULL
               AND completed_at >= ?2
               AND session_id <> ?3
             ORDER BY completed_at DESC
             LIMIT 1",
        )?;
        let found = stmt
            .query_row(
                params![
                    file_hash,
                    format_timestamp(Some(cutoff)),
                    exclude_session
                ],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(found)
    }

    /// First record with the same name and byte size seen active or
    /// completed since the cutoff. Catches resubmissions racing the hash
    /// computation of an in-flight twin.
    pub fn active_with_name_size_since(
        &self,
        file_name: &str,
        file_size: i64,
        cutoff: DateTime<Utc>,
        exclude_session: &str,
    ) -> JournalResult<Option<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT session_id FROM upload_journal
             WHERE file_name = ?1
               AND file_size = ?2
               AND status IN ('compressing', 'uploading', 'completed')
               AND updated_at >= ?3
               AND session_id <> ?4
             ORDER BY updated_at DESC
             LIMIT 1",
        )?;
        let found = stmt
            .query_row(
                params![
                    file_name,
                    file_size,
                    format_timestamp(Some(cutoff)),
                    exclude_session
                ],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(found)
    }

    pub fn purge_terminal(&self) -> JournalResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM upload_journal
             WHERE status IN ('completed', 'failed', 'duplicate', 'cancelled')",
            [],
        )?;
        Ok(affected)
    }

    pub fn export_dump(&self, output: impl AsRef<Path>) -> JournalResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        let mut dump = String::new();
        dump.push_str(JOURNAL_SCHEMA);
        dump.push('\n');
        dump.push_str("BEGIN;\n");

        let mut stmt = conn.prepare(
            "SELECT session_id, target_id, file_name, file_size, kind, status, progress,
                    error, variant_urls, retry_count, file_hash, diagnostics,
                    started_at, completed_at, updated_at
             FROM upload_journal ORDER BY session_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, Option<String>>(12)?,
                row.get::<_, Option<String>>(13)?,
                row.get::<_, Option<String>>(14)?,
            ))
        })?;

        for row in rows {
            let (
                session_id,
                target_id,
                file_name,
                file_size,
                kind,
                status,
                progress,
                error,
                variant_urls,
                retry_count,
                file_hash,
                diagnostics,
                started_at,
                completed_at,
                updated_at,
            ) = row?;
            dump.push_str(&format!(
                "INSERT INTO upload_journal (session_id, target_id, file_name, file_size, kind, status, progress, error, variant_urls, retry_count, file_hash, diagnostics, started_at, completed_at, updated_at) VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {});\n",
                sql_quote(&session_id),
                format_optional_text(target_id),
                sql_quote(&file_name),
                file_size,
                sql_quote(&kind),
                sql_quote(&status),
                progress,
                format_optional_text(error),
                format_optional_text(variant_urls),
                retry_count,
                format_optional_text(file_hash),
                format_optional_text(diagnostics),
                format_optional_text(started_at),
                format_optional_text(completed_at),
                format_optional_text(updated_at),
            ));
        }

        dump.push_str("COMMIT;\n");

        let file = File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(dump.as_bytes())?;
        encoder.finish()?;
        Ok(())
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> JournalResult<()> {
        let destination_path = destination.as_ref();
        let source = self.open()?;
        let mut dest = Connection::open(destination_path)?;
        configure_connection(&dest).map_err(|source| JournalError::OpenDatabase {
            source,
            path: destination_path.to_path_buf(),
        })?;
        let backup = Backup::new(&source, &mut dest)?;
        backup.run_to_completion(10, StdDuration::from_millis(50), None)?;
        Ok(())
    }
}

fn sql_quote(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}

fn format_optional_text(value: Option<String>) -> String {
    value
        .map(|v| sql_quote(&v))
        .unwrap_or_else(|| "NULL".to_string())
}
