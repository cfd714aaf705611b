use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crux_media::transfer::{
    ChunkReceipt, ChunkRequest, ChunkTransport, ChunkedTransferClient, TransferError,
    TransferResult, TransferTask,
};
use crux_media::{RetrySection, TransferSection};

#[derive(Default)]
struct ScriptedTransport {
    requests: Mutex<Vec<(ChunkRequest, Bytes)>>,
    failures: Mutex<VecDeque<TransferError>>,
    final_url: Option<String>,
    poll_answers: Mutex<VecDeque<Option<String>>>,
    polls: AtomicUsize,
}

impl ScriptedTransport {
    fn with_final_url(url: &str) -> Self {
        Self {
            final_url: Some(url.to_string()),
            ..Self::default()
        }
    }

    fn recorded(&self) -> Vec<(ChunkRequest, Bytes)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkTransport for ScriptedTransport {
    async fn send_chunk(
        &self,
        request: &ChunkRequest,
        payload: Bytes,
    ) -> TransferResult<ChunkReceipt> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), payload));
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let last = request.chunk_number + 1 == request.total_chunks;
        Ok(ChunkReceipt {
            status: Some("ok".to_string()),
            url: if last { self.final_url.clone() } else { None },
        })
    }

    async fn poll_status(
        &self,
        _session_key: &str,
        _bearer_token: Option<&str>,
    ) -> TransferResult<ChunkReceipt> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let url = self
            .poll_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(None);
        Ok(ChunkReceipt { status: None, url })
    }
}

/// Never answers; every send looks like a dead connection.
struct SilentTransport;

#[async_trait]
impl ChunkTransport for SilentTransport {
    async fn send_chunk(
        &self,
        _request: &ChunkRequest,
        _payload: Bytes,
    ) -> TransferResult<ChunkReceipt> {
        futures::future::pending().await
    }

    async fn poll_status(
        &self,
        _session_key: &str,
        _bearer_token: Option<&str>,
    ) -> TransferResult<ChunkReceipt> {
        futures::future::pending().await
    }
}

fn transfer_section(chunk_size: usize) -> TransferSection {
    TransferSection {
        chunk_size_bytes: chunk_size,
        stall_timeout_seconds: 1,
        status_poll_attempts: 3,
        status_poll_delay_ms: 1,
    }
}

fn retry_section(max_retries: u32) -> RetrySection {
    RetrySection {
        max_retries,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter_ms: 0,
    }
}

fn task() -> TransferTask {
    TransferTask {
        session_key: "up-t1:hd".to_string(),
        file_name: "crux-send.mp4".to_string(),
        mime_type: "video/mp4".to_string(),
        bearer_token: Some("token-abc".to_string()),
    }
}

fn client(transport: Arc<dyn ChunkTransport>, chunk_size: usize, max_retries: u32) -> ChunkedTransferClient {
    ChunkedTransferClient::new(transport, &transfer_section(chunk_size), &retry_section(max_retries))
}

#[tokio::test]
async fn payload_splits_into_fixed_chunks() {
    let transport = Arc::new(ScriptedTransport::with_final_url("https://cdn.test/hd.mp4"));
    let client = client(transport.clone(), 3, 0);
    let progress: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = progress.clone();

    let url = client
        .upload(
            &task(),
            Bytes::from_static(b"0123456789"),
            &CancellationToken::new(),
            &move |fraction| progress_sink.lock().unwrap().push(fraction),
            &|| {},
        )
        .await
        .unwrap();

    assert_eq!(url, "https://cdn.test/hd.mp4");
    let sent = transport.recorded();
    assert_eq!(sent.len(), 4);
    for (index, (request, payload)) in sent.iter().enumerate() {
        assert_eq!(request.chunk_number, index as u64);
        assert_eq!(request.total_chunks, 4);
        assert_eq!(request.file_size, 10);
        assert_eq!(request.session_key, "up-t1:hd");
        assert_eq!(request.file_name, "crux-send.mp4");
        assert_eq!(request.mime_type, "video/mp4");
        assert_eq!(request.bearer_token.as_deref(), Some("token-abc"));
        let expected_len = if index == 3 { 1 } else { 3 };
        assert_eq!(payload.len(), expected_len);
    }
    let reassembled: Vec<u8> = sent
        .iter()
        .flat_map(|(_, payload)| payload.iter().copied())
        .collect();
    assert_eq!(reassembled, b"0123456789");
    assert_eq!(*progress.lock().unwrap(), vec![0.25, 0.5, 0.75, 1.0]);
}

#[tokio::test]
async fn single_chunk_payloads_keep_the_contract() {
    let transport = Arc::new(ScriptedTransport::with_final_url("https://cdn.test/one"));
    let client = client(transport.clone(), 5_242_880, 0);

    client
        .upload(
            &task(),
            Bytes::from_static(b"hi"),
            &CancellationToken::new(),
            &|_| {},
            &|| {},
        )
        .await
        .unwrap();

    let sent = transport.recorded();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.chunk_number, 0);
    assert_eq!(sent[0].0.total_chunks, 1);
    assert_eq!(sent[0].0.file_size, 2);
}

#[tokio::test]
async fn missing_final_url_falls_back_to_polling() {
    let transport = Arc::new(ScriptedTransport::default());
    transport
        .poll_answers
        .lock()
        .unwrap()
        .extend([None, Some("https://cdn.test/late.mp4".to_string())]);
    let client = client(transport.clone(), 4, 0);

    let url = client
        .upload(
            &task(),
            Bytes::from_static(b"abcd"),
            &CancellationToken::new(),
            &|_| {},
            &|| {},
        )
        .await
        .unwrap();

    assert_eq!(url, "https://cdn.test/late.mp4");
    assert_eq!(transport.polls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_polls_report_a_missing_url() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = client(transport.clone(), 4, 0);

    let error = client
        .upload(
            &task(),
            Bytes::from_static(b"abcd"),
            &CancellationToken::new(),
            &|_| {},
            &|| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(error, TransferError::MissingRemoteUrl));
    assert_eq!(transport.polls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn server_errors_retry_until_success() {
    let transport = Arc::new(ScriptedTransport::with_final_url("https://cdn.test/ok"));
    transport.failures.lock().unwrap().extend([
        TransferError::Endpoint {
            status: 503,
            body: "busy".to_string(),
        },
        TransferError::Endpoint {
            status: 503,
            body: "busy".to_string(),
        },
        TransferError::Endpoint {
            status: 503,
            body: "busy".to_string(),
        },
    ]);
    let client = client(transport.clone(), 3, 3);
    let retries = Arc::new(AtomicUsize::new(0));
    let retry_sink = retries.clone();

    let url = client
        .upload(
            &task(),
            Bytes::from_static(b"0123456789"),
            &CancellationToken::new(),
            &|_| {},
            &move || {
                retry_sink.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

    assert_eq!(url, "https://cdn.test/ok");
    assert_eq!(retries.load(Ordering::SeqCst), 3);
    // Three failed attempts on the first chunk, then four clean sends.
    assert_eq!(transport.recorded().len(), 7);
}

#[tokio::test]
async fn client_errors_fail_without_retry() {
    let transport = Arc::new(ScriptedTransport::default());
    transport
        .failures
        .lock()
        .unwrap()
        .push_back(TransferError::Endpoint {
            status: 422,
            body: "unsupported codec".to_string(),
        });
    let client = client(transport.clone(), 4, 3);
    let retries = Arc::new(AtomicUsize::new(0));
    let retry_sink = retries.clone();

    let error = client
        .upload(
            &task(),
            Bytes::from_static(b"abcd"),
            &CancellationToken::new(),
            &|_| {},
            &move || {
                retry_sink.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.to_string(),
        "upload endpoint returned 422: unsupported codec"
    );
    assert_eq!(retries.load(Ordering::SeqCst), 0);
    assert_eq!(transport.recorded().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_sends_retry_then_surface() {
    let client = client(Arc::new(SilentTransport), 4, 1);
    let retries = Arc::new(AtomicUsize::new(0));
    let retry_sink = retries.clone();

    let error = client
        .upload(
            &task(),
            Bytes::from_static(b"abcd"),
            &CancellationToken::new(),
            &|_| {},
            &move || {
                retry_sink.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(error, TransferError::Stalled(_)));
    assert_eq!(retries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pre_cancelled_tokens_short_circuit() {
    let client = client(Arc::new(SilentTransport), 4, 3);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = client
        .upload(
            &task(),
            Bytes::from_static(b"abcd"),
            &cancel,
            &|_| {},
            &|| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(error, TransferError::Cancelled));
}
