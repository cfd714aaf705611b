use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MediaConfig {
    pub limits: LimitsSection,
    pub transfer: TransferSection,
    pub retry: RetrySection,
    pub dedup: DedupSection,
    pub transcode: TranscodeSection,
    pub profiles: ProfilesSection,
    pub endpoints: EndpointsSection,
    pub paths: PathsSection,
}

impl MediaConfig {
    pub fn journal_db_path(&self) -> PathBuf {
        Path::new(&self.paths.data_dir).join("journal.sqlite")
    }

    pub fn staging_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.staging_dir)
    }

    pub fn failure_log_path(&self) -> PathBuf {
        Path::new(&self.paths.logs_dir).join("upload_failures.log")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_active_jobs: usize,
    pub completed_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferSection {
    pub chunk_size_bytes: usize,
    pub stall_timeout_seconds: u64,
    pub status_poll_attempts: u32,
    pub status_poll_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupSection {
    pub hash_window_seconds: i64,
    pub name_size_window_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub preset: String,
    pub progress_poll_ms: u64,
    pub stall_timeout_seconds: u64,
    pub thumb_max_dimension: u32,
    pub staging_ttl_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilesSection {
    pub hd: ProfileEntry,
    pub sd: ProfileEntry,
    pub low: ProfileEntry,
}

impl ProfilesSection {
    /// Renditions in descending quality order. Upload and catalog entries
    /// follow this order so the first URL is the primary one.
    pub fn renditions(&self) -> [(&'static str, &ProfileEntry); 3] {
        [("hd", &self.hd), ("sd", &self.sd), ("low", &self.low)]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileEntry {
    pub scale: String,
    pub video_bitrate: String,
    pub audio_bitrate: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsSection {
    pub upload_url: String,
    pub status_url: String,
    pub catalog_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub staging_dir: String,
    pub logs_dir: String,
}

pub fn load_media_config<P: AsRef<Path>>(path: P) -> Result<MediaConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
