use thiserror::Error;

use crate::journal::JournalError;
use crate::transcode::TranscodeError;
use crate::transfer::TransferError;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("source payload is empty")]
    EmptySource,
    #[error("no source payload attached to session {session_id}")]
    MissingSource { session_id: String },
    #[error("upload session {session_id} not found")]
    UnknownSession { session_id: String },
    #[error("upload session {session_id} in unexpected status: {status}")]
    InvalidStatus { session_id: String, status: String },
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("{0}")]
    Transcode(#[from] TranscodeError),
    #[error("{0}")]
    Transfer(#[from] TransferError),
    #[error("catalog commit failed: {0}")]
    Commit(String),
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
