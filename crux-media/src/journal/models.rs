use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Error text written when the operator cancels a job. Records carrying
/// one of these sentinels are never rehydrated after a restart.
pub const CANCELLED_BY_USER: &str = "cancelled by user";
/// Error text written just before a record is deleted on dismiss, so a
/// crash between the two writes still leaves a non-restorable row.
pub const REMOVED_BY_USER: &str = "removed by user";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Thumbnail,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Thumbnail => "thumbnail",
        }
    }

    /// Variant names this kind must produce, in descending quality order.
    pub fn required_variants(&self) -> &'static [&'static str] {
        match self {
            MediaKind::Video => &["hd", "sd", "low"],
            MediaKind::Thumbnail => &["thumb"],
        }
    }

    /// Variant whose URL becomes the catalog's primary URL.
    pub fn primary_variant(&self) -> &'static str {
        match self {
            MediaKind::Video => "hd",
            MediaKind::Thumbnail => "thumb",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(MediaKind::Video),
            "thumbnail" => Ok(MediaKind::Thumbnail),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Compressing,
    Uploading,
    Completed,
    Failed,
    Duplicate,
    Cancelled,
    Restoring,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Compressing => "compressing",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Duplicate => "duplicate",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Restoring => "restoring",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Duplicate | JobStatus::Cancelled
        )
    }

    /// Holding an admission slot: from leaving pending until a terminal
    /// status is reached.
    pub fn active(&self) -> bool {
        matches!(self, JobStatus::Compressing | JobStatus::Uploading)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "compressing" => Ok(JobStatus::Compressing),
            "uploading" => Ok(JobStatus::Uploading),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "duplicate" => Ok(JobStatus::Duplicate),
            "cancelled" => Ok(JobStatus::Cancelled),
            "restoring" => Ok(JobStatus::Restoring),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadRecord {
    pub session_id: String,
    pub target_id: Option<String>,
    pub file_name: String,
    pub file_size: i64,
    pub kind: MediaKind,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub variant_urls: BTreeMap<String, String>,
    pub retry_count: i64,
    pub file_hash: Option<String>,
    pub diagnostics: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    pub fn new(
        session_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: i64,
        kind: MediaKind,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            target_id: None,
            file_name: file_name.into(),
            file_size,
            kind,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            variant_urls: BTreeMap::new(),
            retry_count: 0,
            file_hash: None,
            diagnostics: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            updated_at: None,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let started_at: Option<NaiveDateTime> = row.get("started_at")?;
        let completed_at: Option<NaiveDateTime> = row.get("completed_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        let variant_urls: Option<String> = row.get("variant_urls")?;
        let diagnostics: Option<String> = row.get("diagnostics")?;
        Ok(Self {
            session_id: row.get("session_id")?,
            target_id: row.get("target_id")?,
            file_name: row.get("file_name")?,
            file_size: row.get("file_size")?,
            kind: row
                .get::<_, String>("kind")?
                .parse()
                .unwrap_or(MediaKind::Video),
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(JobStatus::Pending),
            progress: row.get::<_, i64>("progress")?.clamp(0, 100) as u8,
            error: row.get("error")?,
            variant_urls: variant_urls
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            retry_count: row.get("retry_count")?,
            file_hash: row.get("file_hash")?,
            diagnostics: diagnostics
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            started_at: started_at.map(|dt| Utc.from_utc_datetime(&dt)),
            completed_at: completed_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    pub fn serialize_variants(&self) -> Option<String> {
        if self.variant_urls.is_empty() {
            None
        } else {
            serde_json::to_string(&self.variant_urls).ok()
        }
    }

    pub fn serialize_diagnostics(&self) -> Option<String> {
        self.diagnostics
            .as_ref()
            .and_then(|value| serde_json::to_string(value).ok())
    }

    /// True once every variant required by the kind has a stored URL.
    /// Such a record only has the catalog commit left to redo.
    pub fn has_all_variants(&self) -> bool {
        self.kind
            .required_variants()
            .iter()
            .all(|variant| self.variant_urls.contains_key(*variant))
    }

    pub fn primary_url(&self) -> Option<&str> {
        self.variant_urls
            .get(self.kind.primary_variant())
            .map(String::as_str)
    }
}
