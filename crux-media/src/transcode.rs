use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use image::GenericImageView;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{ProfileEntry, ProfilesSection, TranscodeSection};
use crate::journal::MediaKind;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("source rejected: {0}")]
    Rejected(String),
    #[error("compression ran out of device resources: {0}")]
    ResourceExhausted(String),
    #[error("no compression progress for {0:?}")]
    Stalled(Duration),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("compression failed: {0}")]
    Failed(String),
    #[error("compression cancelled")]
    Cancelled,
}

pub type TranscodeResult<T> = std::result::Result<T, TranscodeError>;

/// Raw upload payload as handed over by the caller.
#[derive(Debug, Clone)]
pub struct SourceMedia {
    pub file_name: String,
    pub bytes: Bytes,
}

/// One finished rendition, held in memory until its transfer completes.
#[derive(Debug, Clone)]
pub struct VariantBlob {
    pub variant: String,
    pub bytes: Bytes,
    pub mime_type: String,
}

#[async_trait]
pub trait VariantTranscoder: Send + Sync {
    /// Produces every variant the kind requires, in descending quality
    /// order. `on_progress` receives the overall compression fraction.
    async fn transcode(
        &self,
        session_id: &str,
        source: &SourceMedia,
        kind: MediaKind,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> TranscodeResult<Vec<VariantBlob>>;

    /// Reclaims staging leftovers from earlier crashed runs. Returns the
    /// number of directories removed. No-op for transcoders that do not
    /// stage on disk.
    fn sweep_stale(&self) -> usize {
        0
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.output().await
    }
}

/// ffmpeg-backed transcoder. Videos become three H.264 renditions;
/// thumbnails are resized and re-encoded in process.
pub struct FfmpegTranscoder {
    config: TranscodeSection,
    profiles: ProfilesSection,
    staging_root: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl FfmpegTranscoder {
    pub fn new(
        config: TranscodeSection,
        profiles: ProfilesSection,
        staging_root: impl AsRef<Path>,
    ) -> Self {
        Self {
            config,
            profiles,
            staging_root: staging_root.as_ref().to_path_buf(),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Removes staging directories older than the configured TTL. Normal
    /// runs clean up after themselves; this catches crash leftovers.
    pub fn sweep_stale_staging(&self) -> usize {
        let ttl = Duration::from_secs(self.config.staging_ttl_hours.max(1) * 3600);
        let mut removed = 0;
        for entry in WalkDir::new(&self.staging_root).min_depth(1).max_depth(1) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            if !entry.file_name().to_string_lossy().starts_with("upload-") {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .map(|age| age > ttl)
                .unwrap_or(false);
            if stale && std::fs::remove_dir_all(entry.path()).is_ok() {
                info!(path = %entry.path().display(), "removed stale staging directory");
                removed += 1;
            }
        }
        removed
    }

    async fn compress_video(
        &self,
        session_id: &str,
        source: &SourceMedia,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> TranscodeResult<Vec<VariantBlob>> {
        let staging = self.staging_root.join(format!("upload-{session_id}"));
        fs::create_dir_all(&staging)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: staging.clone(),
            })?;

        let result = self
            .compress_video_in(&staging, source, cancel, on_progress)
            .await;
        if let Err(error) = fs::remove_dir_all(&staging).await {
            warn!(path = %staging.display(), error = %error, "failed to clean staging directory");
        }
        result
    }

    async fn compress_video_in(
        &self,
        staging: &Path,
        source: &SourceMedia,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> TranscodeResult<Vec<VariantBlob>> {
        let source_path = staging.join("source.bin");
        fs::write(&source_path, &source.bytes)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: source_path.clone(),
            })?;

        let duration_s = match self.probe_duration(&source_path).await {
            Ok(duration) => Some(duration),
            Err(TranscodeError::Rejected(reason)) => {
                return Err(TranscodeError::Rejected(reason));
            }
            Err(error) => {
                warn!(error = %error, "duration probe failed, progress will be coarse");
                None
            }
        };

        let renditions = self.profiles.renditions();
        let share = 1.0 / renditions.len() as f64;
        let mut variants = Vec::with_capacity(renditions.len());

        for (index, (name, profile)) in renditions.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TranscodeError::Cancelled);
            }
            let output_path = staging.join(format!("{name}.mp4"));
            let progress_path = staging.join(format!("{name}.progress"));
            let args =
                self.rendition_args(&source_path, profile, &progress_path, &output_path);

            let mut command = Command::new(&self.config.ffmpeg_path);
            for arg in &args {
                command.arg(arg);
            }
            let base = index as f64 * share;
            let output = self
                .run_rendition(&mut command, &progress_path, duration_s, cancel, &|frac| {
                    on_progress(base + frac * share)
                })
                .await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                return Err(classify_failure(output.status.code(), &stderr));
            }

            let bytes = fs::read(&output_path)
                .await
                .map_err(|source| TranscodeError::Io {
                    source,
                    path: output_path.clone(),
                })?;
            debug!(
                variant = name,
                bytes = bytes.len(),
                "rendition finished"
            );
            variants.push(VariantBlob {
                variant: (*name).to_string(),
                bytes: Bytes::from(bytes),
                mime_type: "video/mp4".to_string(),
            });
            on_progress((index + 1) as f64 * share);
        }

        Ok(variants)
    }

    fn rendition_args(
        &self,
        source_path: &Path,
        profile: &ProfileEntry,
        progress_path: &Path,
        output_path: &Path,
    ) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            source_path.display().to_string(),
            "-vf".to_string(),
            format!("scale={}", profile.scale),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.config.preset.clone(),
            "-b:v".to_string(),
            profile.video_bitrate.clone(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            profile.audio_bitrate.clone(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-nostats".to_string(),
            "-progress".to_string(),
            progress_path.display().to_string(),
            output_path.display().to_string(),
        ]
    }

    /// Drives one ffmpeg run while tailing its progress file. Trips when
    /// the file stops advancing for the stall window, and aborts the
    /// child on cancellation.
    async fn run_rendition(
        &self,
        command: &mut Command,
        progress_path: &Path,
        duration_s: Option<f64>,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> TranscodeResult<Output> {
        command.kill_on_drop(true);
        let poll = Duration::from_millis(self.config.progress_poll_ms.max(50));
        let stall_after = Duration::from_secs(self.config.stall_timeout_seconds.max(1));
        let mut last_beat = Instant::now();
        let mut last_micros = None;

        let run = self.executor.run(command);
        tokio::pin!(run);

        loop {
            tokio::select! {
                output = &mut run => {
                    return output.map_err(|source| TranscodeError::Io {
                        source,
                        path: PathBuf::from(&self.config.ffmpeg_path),
                    });
                }
                _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
                _ = sleep(poll) => {
                    if let Ok(content) = std::fs::read_to_string(progress_path) {
                        if let Some(micros) = parse_progress_micros(&content) {
                            if last_micros != Some(micros) {
                                last_micros = Some(micros);
                                last_beat = Instant::now();
                            }
                            if let Some(total) = duration_s {
                                if total > 0.0 {
                                    let frac = micros as f64 / 1_000_000.0 / total;
                                    on_progress(frac.clamp(0.0, 1.0));
                                }
                            }
                        }
                    }
                    if last_beat.elapsed() > stall_after {
                        return Err(TranscodeError::Stalled(stall_after));
                    }
                }
            }
        }
    }

    async fn probe_duration(&self, path: &Path) -> TranscodeResult<f64> {
        let mut command = Command::new(&self.config.ffprobe_path);
        command
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg(path);
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: PathBuf::from(&self.config.ffprobe_path),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Rejected(format!(
                "unreadable media: {}",
                stderr_tail(&stderr)
            )));
        }

        #[derive(Deserialize)]
        struct ProbeOutput {
            format: Option<ProbeFormat>,
        }
        #[derive(Deserialize)]
        struct ProbeFormat {
            duration: Option<String>,
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|error| TranscodeError::Failed(format!("ffprobe output: {error}")))?;
        probe
            .format
            .and_then(|format| format.duration)
            .and_then(|duration| duration.parse::<f64>().ok())
            .filter(|duration| *duration > 0.0)
            .ok_or_else(|| TranscodeError::Failed("ffprobe reported no duration".to_string()))
    }

    fn shrink_thumbnail(
        &self,
        source: &SourceMedia,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> TranscodeResult<Vec<VariantBlob>> {
        let decoded = image::load_from_memory(&source.bytes)
            .map_err(|error| TranscodeError::Rejected(format!("unreadable image: {error}")))?;
        on_progress(0.5);

        let bound = self.config.thumb_max_dimension.max(16);
        let (width, height) = decoded.dimensions();
        let resized = if width > bound || height > bound {
            decoded.resize(bound, bound, image::imageops::FilterType::Triangle)
        } else {
            decoded
        };

        // JPEG cannot carry an alpha channel.
        let rgb = image::DynamicImage::ImageRgb8(resized.to_rgb8());
        let mut buffer = Vec::new();
        rgb.write_to(
            &mut std::io::Cursor::new(&mut buffer),
            image::ImageOutputFormat::Jpeg(85),
        )
        .map_err(|error| TranscodeError::Failed(format!("thumbnail encode: {error}")))?;
        on_progress(1.0);

        Ok(vec![VariantBlob {
            variant: "thumb".to_string(),
            bytes: Bytes::from(buffer),
            mime_type: "image/jpeg".to_string(),
        }])
    }
}

#[async_trait]
impl VariantTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        session_id: &str,
        source: &SourceMedia,
        kind: MediaKind,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> TranscodeResult<Vec<VariantBlob>> {
        match kind {
            MediaKind::Video => {
                self.compress_video(session_id, source, cancel, on_progress)
                    .await
            }
            MediaKind::Thumbnail => self.shrink_thumbnail(source, on_progress),
        }
    }

    fn sweep_stale(&self) -> usize {
        self.sweep_stale_staging()
    }
}

fn classify_failure(status_code: Option<i32>, stderr: &str) -> TranscodeError {
    let tail = stderr_tail(stderr);
    let lowered = stderr.to_lowercase();
    // A missing exit code means the child died from a signal, which on
    // constrained devices is almost always the out-of-memory killer.
    if status_code.is_none()
        || lowered.contains("cannot allocate memory")
        || lowered.contains("out of memory")
    {
        return TranscodeError::ResourceExhausted(tail);
    }
    if lowered.contains("invalid data")
        || lowered.contains("moov atom")
        || lowered.contains("could not find codec")
        || lowered.contains("invalid argument")
    {
        return TranscodeError::Rejected(tail);
    }
    TranscodeError::Failed(tail)
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "no detail from encoder".to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(300)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    tail
}

// ffmpeg writes microseconds in both out_time_us and out_time_ms.
fn parse_progress_micros(content: &str) -> Option<u64> {
    let mut latest = None;
    for line in content.lines() {
        if let Some(value) = line
            .strip_prefix("out_time_us=")
            .or_else(|| line.strip_prefix("out_time_ms="))
        {
            if let Ok(micros) = value.trim().parse::<u64>() {
                latest = Some(micros);
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    #[cfg(unix)]
    use std::os::unix::process::ExitStatusExt;
    #[cfg(windows)]
    use std::os::windows::process::ExitStatusExt;

    use tempfile::TempDir;

    fn transcode_section() -> TranscodeSection {
        TranscodeSection {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            preset: "veryfast".to_string(),
            progress_poll_ms: 50,
            stall_timeout_seconds: 30,
            thumb_max_dimension: 64,
            staging_ttl_hours: 6,
        }
    }

    fn profiles() -> ProfilesSection {
        let entry = |scale: &str, video: &str, audio: &str| ProfileEntry {
            scale: scale.to_string(),
            video_bitrate: video.to_string(),
            audio_bitrate: audio.to_string(),
        };
        ProfilesSection {
            hd: entry("1280:-2", "2500k", "128k"),
            sd: entry("854:-2", "1200k", "96k"),
            low: entry("480:-2", "600k", "64k"),
        }
    }

    fn success_status() -> std::process::ExitStatus {
        #[cfg(unix)]
        {
            std::process::ExitStatus::from_raw(0)
        }
        #[cfg(windows)]
        {
            std::process::ExitStatus::from_raw(0)
        }
    }

    /// Plays both ffprobe and ffmpeg: answers probes with a fixed
    /// duration and writes a marker file at the output path of every
    /// rendition invocation.
    struct FakeEncoder {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl CommandExecutor for FakeEncoder {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let std_command = command.as_std();
            let program = std_command.get_program().to_string_lossy().into_owned();
            let args: Vec<String> = std_command
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            self.calls.lock().unwrap().push(args.clone());

            let stdout = if program.contains("ffprobe") {
                br#"{"format":{"duration":"12.5"}}"#.to_vec()
            } else {
                let output_path = args.last().expect("rendition has an output path");
                std::fs::write(output_path, b"encoded")?;
                Vec::new()
            };
            Ok(Output {
                status: success_status(),
                stdout,
                stderr: Vec::new(),
            })
        }
    }

    fn sample_png() -> Vec<u8> {
        let pixels = image::RgbImage::from_fn(200, 120, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        });
        let mut buffer = Vec::new();
        image::DynamicImage::ImageRgb8(pixels)
            .write_to(
                &mut std::io::Cursor::new(&mut buffer),
                image::ImageOutputFormat::Png,
            )
            .unwrap();
        buffer
    }

    #[tokio::test]
    async fn video_produces_three_renditions() {
        let staging = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let transcoder = FfmpegTranscoder::new(transcode_section(), profiles(), staging.path())
            .with_executor(Arc::new(FakeEncoder {
                calls: calls.clone(),
            }));
        let source = SourceMedia {
            file_name: "send.mp4".to_string(),
            bytes: Bytes::from_static(b"fake video payload"),
        };

        let variants = transcoder
            .transcode(
                "up-test",
                &source,
                MediaKind::Video,
                &CancellationToken::new(),
                &|_| {},
            )
            .await
            .unwrap();

        let names: Vec<&str> = variants.iter().map(|v| v.variant.as_str()).collect();
        assert_eq!(names, vec!["hd", "sd", "low"]);
        assert!(variants.iter().all(|v| v.mime_type == "video/mp4"));
        assert!(variants.iter().all(|v| !v.bytes.is_empty()));
        // One probe plus one encode per rendition.
        assert_eq!(calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn rendition_args_carry_profile_settings() {
        let staging = TempDir::new().unwrap();
        let transcoder =
            FfmpegTranscoder::new(transcode_section(), profiles(), staging.path());
        let args = transcoder.rendition_args(
            Path::new("/tmp/source.bin"),
            &profiles().hd,
            Path::new("/tmp/hd.progress"),
            Path::new("/tmp/hd.mp4"),
        );
        assert!(args.contains(&"scale=1280:-2".to_string()));
        assert!(args.contains(&"2500k".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/hd.mp4");
    }

    #[tokio::test]
    async fn thumbnail_is_resized_and_reencoded() {
        let staging = TempDir::new().unwrap();
        let transcoder =
            FfmpegTranscoder::new(transcode_section(), profiles(), staging.path());
        let source = SourceMedia {
            file_name: "topo.png".to_string(),
            bytes: Bytes::from(sample_png()),
        };

        let variants = transcoder
            .transcode(
                "up-thumb",
                &source,
                MediaKind::Thumbnail,
                &CancellationToken::new(),
                &|_| {},
            )
            .await
            .unwrap();

        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].variant, "thumb");
        assert_eq!(variants[0].mime_type, "image/jpeg");
        assert_eq!(&variants[0].bytes[..2], &[0xff, 0xd8]);
        let reloaded = image::load_from_memory(&variants[0].bytes).unwrap();
        assert!(reloaded.width() <= 64 && reloaded.height() <= 64);
    }

    #[tokio::test]
    async fn corrupt_thumbnail_is_rejected() {
        let staging = TempDir::new().unwrap();
        let transcoder =
            FfmpegTranscoder::new(transcode_section(), profiles(), staging.path());
        let source = SourceMedia {
            file_name: "broken.png".to_string(),
            bytes: Bytes::from_static(b"not an image at all"),
        };

        let error = transcoder
            .transcode(
                "up-broken",
                &source,
                MediaKind::Thumbnail,
                &CancellationToken::new(),
                &|_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(error, TranscodeError::Rejected(_)));
    }

    #[test]
    fn failure_classification_reads_the_stderr() {
        assert!(matches!(
            classify_failure(None, "killed"),
            TranscodeError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_failure(Some(137), "Cannot allocate memory"),
            TranscodeError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_failure(Some(1), "Invalid data found when processing input"),
            TranscodeError::Rejected(_)
        ));
        assert!(matches!(
            classify_failure(Some(1), "some encoder detail"),
            TranscodeError::Failed(_)
        ));
    }

    #[test]
    fn progress_parser_keeps_the_latest_sample() {
        let content = "frame=10\nout_time_us=1000000\nprogress=continue\nout_time_us=2500000\nprogress=end\n";
        assert_eq!(parse_progress_micros(content), Some(2_500_000));
        assert_eq!(parse_progress_micros("out_time_ms=750000\n"), Some(750_000));
        assert_eq!(parse_progress_micros("out_time_us=-9223372036854775807\n"), None);
        assert_eq!(parse_progress_micros("frame=1\n"), None);
    }

    #[test]
    fn sweep_ignores_fresh_and_foreign_directories() {
        let staging = TempDir::new().unwrap();
        std::fs::create_dir(staging.path().join("upload-fresh")).unwrap();
        std::fs::create_dir(staging.path().join("unrelated")).unwrap();
        let transcoder =
            FfmpegTranscoder::new(transcode_section(), profiles(), staging.path());
        assert_eq!(transcoder.sweep_stale_staging(), 0);
        assert!(staging.path().join("upload-fresh").exists());
        assert!(staging.path().join("unrelated").exists());
    }
}
