use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::journal::{JobStatus, MediaKind, UploadRecord};

/// Caller-supplied request context: the bearer token forwarded to the
/// storage and catalog services, plus free-form diagnostics recorded on
/// the journal row.
#[derive(Debug, Clone, Default)]
pub struct UploadContext {
    pub bearer_token: Option<String>,
    pub diagnostics: Option<Value>,
}

impl UploadContext {
    pub fn with_bearer_token(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            diagnostics: None,
        }
    }
}

/// Point-in-time view of one upload job, published on its watch channel
/// after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub session_id: String,
    pub target_id: Option<String>,
    pub file_name: String,
    pub kind: MediaKind,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub variant_urls: BTreeMap<String, String>,
    pub retry_count: i64,
}

impl JobSnapshot {
    pub fn from_record(record: &UploadRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            target_id: record.target_id.clone(),
            file_name: record.file_name.clone(),
            kind: record.kind,
            status: record.status,
            progress: record.progress,
            error: record.error.clone(),
            variant_urls: record.variant_urls.clone(),
            retry_count: record.retry_count,
        }
    }
}
