use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{EndpointsSection, RetrySection, TransferSection};

pub const HEADER_FILE_NAME: &str = "X-File-Name";
pub const HEADER_FILE_SIZE: &str = "X-File-Size";
pub const HEADER_FILE_TYPE: &str = "X-File-Type";
pub const HEADER_CHUNK_NUMBER: &str = "X-Chunk-Number";
pub const HEADER_TOTAL_CHUNKS: &str = "X-Total-Chunks";
pub const HEADER_SESSION_ID: &str = "X-Upload-Session-Id";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("upload endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("no response for {0:?} while sending a chunk")]
    Stalled(Duration),
    #[error("upload accepted but no remote url was returned")]
    MissingRemoteUrl,
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn retryable(&self) -> bool {
        match self {
            TransferError::Endpoint { status, .. } => matches!(status, 408 | 429 | 500..=599),
            TransferError::Network(_) | TransferError::Stalled(_) => true,
            TransferError::MissingRemoteUrl | TransferError::Cancelled => false,
        }
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// One chunk of one variant, as the receiving endpoint sees it.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub session_key: String,
    pub chunk_number: u64,
    pub total_chunks: u64,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub bearer_token: Option<String>,
}

/// Response body for chunk posts and status polls. Intermediate chunks
/// usually answer with just a status; the final chunk should carry the
/// committed url.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkReceipt {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn send_chunk(
        &self,
        request: &ChunkRequest,
        payload: Bytes,
    ) -> TransferResult<ChunkReceipt>;

    async fn poll_status(
        &self,
        session_key: &str,
        bearer_token: Option<&str>,
    ) -> TransferResult<ChunkReceipt>;
}

pub struct HttpChunkTransport {
    client: Client,
    upload_url: String,
    status_url: String,
}

impl HttpChunkTransport {
    pub fn new(client: Client, endpoints: &EndpointsSection) -> Self {
        Self {
            client,
            upload_url: endpoints.upload_url.clone(),
            status_url: endpoints.status_url.clone(),
        }
    }
}

#[async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn send_chunk(
        &self,
        request: &ChunkRequest,
        payload: Bytes,
    ) -> TransferResult<ChunkReceipt> {
        let part = Part::stream(reqwest::Body::from(payload))
            .file_name(request.file_name.clone())
            .mime_str(&request.mime_type)
            .map_err(|error| TransferError::Network(error.to_string()))?;
        let form = Form::new().part("file", part);

        let mut builder = self
            .client
            .post(&self.upload_url)
            .header(HEADER_FILE_NAME, encode_header_value(&request.file_name))
            .header(HEADER_FILE_SIZE, request.file_size.to_string())
            .header(HEADER_FILE_TYPE, &request.mime_type)
            .header(HEADER_CHUNK_NUMBER, request.chunk_number.to_string())
            .header(HEADER_TOTAL_CHUNKS, request.total_chunks.to_string())
            .header(HEADER_SESSION_ID, &request.session_key);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .multipart(form)
            .send()
            .await
            .map_err(|error| TransferError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<ChunkReceipt>().await.unwrap_or_default())
    }

    async fn poll_status(
        &self,
        session_key: &str,
        bearer_token: Option<&str>,
    ) -> TransferResult<ChunkReceipt> {
        let mut builder = self
            .client
            .get(&self.status_url)
            .query(&[("session", session_key)]);
        if let Some(token) = bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| TransferError::Network(error.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(ChunkReceipt::default());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<ChunkReceipt>().await.unwrap_or_default())
    }
}

/// Doubling backoff capped at a ceiling, with a random jitter slice on
/// top of every delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetrySection) -> Self {
        let base = config.base_delay_ms.max(1);
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(base),
            max_delay: Duration::from_millis(config.max_delay_ms.max(base)),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);
        if self.jitter.is_zero() {
            return backoff;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        backoff + Duration::from_millis(jitter_ms)
    }
}

/// Per-variant transfer identity. The session key must be unique per
/// variant so renditions of one job do not collide server-side.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub session_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub bearer_token: Option<String>,
}

/// Sends one blob as fixed-size sequential chunks. Single-chunk blobs go
/// through the same path so the receiving contract stays uniform.
pub struct ChunkedTransferClient {
    transport: Arc<dyn ChunkTransport>,
    chunk_size: usize,
    stall_timeout: Duration,
    retry: RetryPolicy,
    poll_attempts: u32,
    poll_delay: Duration,
}

impl ChunkedTransferClient {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        transfer: &TransferSection,
        retry: &RetrySection,
    ) -> Self {
        Self {
            transport,
            chunk_size: transfer.chunk_size_bytes.max(1),
            stall_timeout: Duration::from_secs(transfer.stall_timeout_seconds.max(1)),
            retry: RetryPolicy::new(retry),
            poll_attempts: transfer.status_poll_attempts,
            poll_delay: Duration::from_millis(transfer.status_poll_delay_ms),
        }
    }

    /// Uploads the payload and resolves to its committed remote url.
    ///
    /// `on_progress` receives the fraction of chunks acknowledged so far.
    /// `on_retry` fires once per retried chunk attempt so callers can
    /// keep a visible retry count.
    pub async fn upload(
        &self,
        task: &TransferTask,
        payload: Bytes,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        on_retry: &(dyn Fn() + Send + Sync),
    ) -> TransferResult<String> {
        let total_bytes = payload.len();
        let total_chunks = (total_bytes.div_ceil(self.chunk_size)).max(1) as u64;

        let mut final_receipt = ChunkReceipt::default();
        for chunk_number in 0..total_chunks {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let start = chunk_number as usize * self.chunk_size;
            let end = (start + self.chunk_size).min(total_bytes);
            let request = ChunkRequest {
                session_key: task.session_key.clone(),
                chunk_number,
                total_chunks,
                file_name: task.file_name.clone(),
                file_size: total_bytes as u64,
                mime_type: task.mime_type.clone(),
                bearer_token: task.bearer_token.clone(),
            };
            final_receipt = self
                .send_with_retry(&request, payload.slice(start..end), cancel, on_retry)
                .await?;
            on_progress((chunk_number + 1) as f64 / total_chunks as f64);
        }

        if let Some(url) = final_receipt.url {
            return Ok(url);
        }

        debug!(
            session = %task.session_key,
            "final chunk acknowledged without a url, polling status"
        );
        for _ in 0..self.poll_attempts {
            tokio::select! {
                _ = sleep(self.poll_delay) => {}
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            }
            let receipt = self
                .transport
                .poll_status(&task.session_key, task.bearer_token.as_deref())
                .await?;
            if let Some(url) = receipt.url {
                return Ok(url);
            }
        }
        Err(TransferError::MissingRemoteUrl)
    }

    async fn send_with_retry(
        &self,
        request: &ChunkRequest,
        payload: Bytes,
        cancel: &CancellationToken,
        on_retry: &(dyn Fn() + Send + Sync),
    ) -> TransferResult<ChunkReceipt> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let send = self.transport.send_chunk(request, payload.clone());
            let error = tokio::select! {
                outcome = timeout(self.stall_timeout, send) => match outcome {
                    Ok(Ok(receipt)) => return Ok(receipt),
                    Ok(Err(error)) => error,
                    Err(_) => TransferError::Stalled(self.stall_timeout),
                },
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };

            if !error.retryable() || attempt >= self.retry.max_retries() {
                return Err(error);
            }
            attempt += 1;
            on_retry();
            warn!(
                session = %request.session_key,
                chunk = request.chunk_number,
                attempt,
                error = %error,
                "chunk send failed, backing off before retry"
            );
            tokio::select! {
                _ = sleep(self.retry.delay_for_attempt(attempt)) => {}
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            }
        }
    }
}

// Header values must be visible ASCII; anything else ships
// percent-encoded.
fn encode_header_value(value: &str) -> String {
    if value.bytes().all(|byte| (0x20..0x7f).contains(&byte)) {
        value.to_string()
    } else {
        url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
    }
}
