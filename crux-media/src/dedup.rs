use std::fmt;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::config::DedupSection;
use crate::journal::{JournalResult, SqliteJournalStore, UploadRecord};

/// SHA-256 over the raw source bytes, lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateRule {
    ContentHash,
    NameAndSize,
}

impl DuplicateRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateRule::ContentHash => "content_hash",
            DuplicateRule::NameAndSize => "name_and_size",
        }
    }
}

impl fmt::Display for DuplicateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    pub session_id: String,
    pub rule: DuplicateRule,
}

/// Resubmission guard. Two journal probes, either of which marks the
/// incoming job a duplicate: a completed upload with the same content
/// hash inside the wide window, or a same-name same-size record seen
/// active inside the narrow window.
#[derive(Debug, Clone)]
pub struct DuplicatePolicy {
    hash_window: Duration,
    name_size_window: Duration,
}

impl DuplicatePolicy {
    pub fn new(section: &DedupSection) -> Self {
        Self {
            hash_window: Duration::seconds(section.hash_window_seconds),
            name_size_window: Duration::seconds(section.name_size_window_seconds),
        }
    }

    pub fn probe(
        &self,
        journal: &SqliteJournalStore,
        record: &UploadRecord,
        file_hash: &str,
    ) -> JournalResult<Option<DuplicateMatch>> {
        let now = Utc::now();
        if let Some(session_id) = journal.completed_with_hash_since(
            file_hash,
            now - self.hash_window,
            &record.session_id,
        )? {
            return Ok(Some(DuplicateMatch {
                session_id,
                rule: DuplicateRule::ContentHash,
            }));
        }
        if let Some(session_id) = journal.active_with_name_size_since(
            &record.file_name,
            record.file_size,
            now - self.name_size_window,
            &record.session_id,
        )? {
            return Ok(Some(DuplicateMatch {
                session_id,
                rule: DuplicateRule::NameAndSize,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_known_vectors() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn identical_payloads_share_a_fingerprint() {
        let payload = vec![7u8; 4096];
        assert_eq!(fingerprint(&payload), fingerprint(&payload.clone()));
        assert_ne!(fingerprint(&payload), fingerprint(&payload[..4095]));
    }
}
