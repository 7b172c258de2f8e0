use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use resultpack::{
    ArchiveBuilder, ArchiveEntry, ByteSource, ConfirmationService, RequestState, RetryPolicy,
    TransferEngine, TransferProgress, TransferStep, UploadError, UploadOrchestrator,
    UploadRequest, UploadRequestQueue, UploaderConfig,
};

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn queued_request(queue: &UploadRequestQueue, payload_path: &std::path::Path) -> UploadRequest {
    std::fs::write(payload_path, b"container bytes").unwrap();
    let request = UploadRequest::new(
        "archive.tar.zst",
        payload_path,
        "",
        "application/octet-stream",
        "https://uploads.example.org/presigned",
    );
    queue.enqueue(&request).unwrap();
    request
}

/// Fails with a retryable transport error a fixed number of times, then
/// succeeds. Records the attempt count it last saw.
#[derive(Clone)]
struct FlakyTransfer {
    fail_times: u32,
    calls: Arc<AtomicU32>,
    last_attempt: Arc<AtomicU32>,
}

impl FlakyTransfer {
    fn new(fail_times: u32) -> Self {
        Self {
            fail_times,
            calls: Arc::new(AtomicU32::new(0)),
            last_attempt: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl TransferStep for FlakyTransfer {
    async fn transfer(
        &self,
        request: &UploadRequest,
        _payload: &ByteSource,
        _progress: &TransferProgress,
    ) -> Result<(), UploadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_attempt.store(request.attempt_count, Ordering::SeqCst);
        if call <= self.fail_times {
            Err(UploadError::transport(Some(503), "store unavailable", true))
        } else {
            Ok(())
        }
    }
}

/// Always rejects the payload checksum.
#[derive(Clone)]
struct IntegrityRejectingTransfer {
    calls: Arc<AtomicU32>,
}

impl TransferStep for IntegrityRejectingTransfer {
    async fn transfer(
        &self,
        _request: &UploadRequest,
        _payload: &ByteSource,
        _progress: &TransferProgress,
    ) -> Result<(), UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(UploadError::Integrity("Content-MD5 mismatch".to_string()))
    }
}

/// Succeeds after a configurable delay; used to race concurrent drains.
#[derive(Clone)]
struct SlowTransfer {
    delay: Duration,
    calls: Arc<AtomicU32>,
}

impl TransferStep for SlowTransfer {
    async fn transfer(
        &self,
        _request: &UploadRequest,
        _payload: &ByteSource,
        _progress: &TransferProgress,
    ) -> Result<(), UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[derive(Clone)]
struct CountingConfirmation {
    fail_times: u32,
    calls: Arc<AtomicU32>,
}

impl CountingConfirmation {
    fn new(fail_times: u32) -> Self {
        Self {
            fail_times,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl ConfirmationService for CountingConfirmation {
    async fn confirm_upload(&self, _id: &str) -> Result<(), UploadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_times {
            Err(UploadError::Confirmation("record not ready".to_string()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_transient_failures_then_success_completes_once() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(UploadRequestQueue::open(dir.path().join("requests")).unwrap());
    let request = queued_request(&queue, &dir.path().join("archive.tar.zst"));

    let engine = FlakyTransfer::new(2);
    let confirmation = CountingConfirmation::new(0);
    let orchestrator = UploadOrchestrator::new(
        queue.clone(),
        engine.clone(),
        confirmation.clone(),
        fast_policy(5),
        2,
    );

    let outcome = orchestrator.drain().await.unwrap();
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.abandoned, 0);

    // Two transient failures, one success: attempt count reflects N+1.
    assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.last_attempt.load(Ordering::SeqCst), 3);

    // Exactly one confirmation and one removal.
    assert_eq!(confirmation.calls.load(Ordering::SeqCst), 1);
    assert!(queue.get(&request.id).unwrap().is_none());
    assert!(queue.list_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_integrity_rejection_never_confirms_or_removes() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(UploadRequestQueue::open(dir.path().join("requests")).unwrap());
    let request = queued_request(&queue, &dir.path().join("archive.tar.zst"));

    let engine = IntegrityRejectingTransfer {
        calls: Arc::new(AtomicU32::new(0)),
    };
    let confirmation = CountingConfirmation::new(0);
    let orchestrator = UploadOrchestrator::new(
        queue.clone(),
        engine.clone(),
        confirmation.clone(),
        fast_policy(2),
        1,
    );

    let outcome = orchestrator.drain().await.unwrap();
    assert_eq!(outcome.completed, 0);
    assert_eq!(outcome.abandoned, 1);

    assert_eq!(confirmation.calls.load(Ordering::SeqCst), 0);

    // Never silently dropped: the record stays, marked abandoned with a
    // retrievable reason.
    let stored = queue.get(&request.id).unwrap().unwrap();
    assert_eq!(stored.state, RequestState::Abandoned);
    assert!(stored
        .abandoned_reason
        .as_deref()
        .unwrap()
        .contains("checksum"));
}

#[tokio::test]
async fn test_confirmation_retry_does_not_retransfer() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(UploadRequestQueue::open(dir.path().join("requests")).unwrap());
    let request = queued_request(&queue, &dir.path().join("archive.tar.zst"));

    let engine = FlakyTransfer::new(0);
    let confirmation = CountingConfirmation::new(1);
    let orchestrator = UploadOrchestrator::new(
        queue.clone(),
        engine.clone(),
        confirmation.clone(),
        fast_policy(5),
        1,
    );

    let outcome = orchestrator.drain().await.unwrap();
    assert_eq!(outcome.completed, 1);

    // Bytes were transferred exactly once; only the acknowledgment was
    // retried.
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    assert_eq!(confirmation.calls.load(Ordering::SeqCst), 2);
    assert!(queue.get(&request.id).unwrap().is_none());
}

#[tokio::test]
async fn test_awaiting_confirmation_record_skips_transfer_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(UploadRequestQueue::open(dir.path().join("requests")).unwrap());
    let mut request = queued_request(&queue, &dir.path().join("archive.tar.zst"));

    // Simulate a crash between transfer and confirmation: the persisted
    // record says the bytes are already on the remote store.
    request.state = RequestState::AwaitingConfirmation;
    request.attempt_count = 1;
    queue.update(&request).unwrap();

    let engine = FlakyTransfer::new(0);
    let confirmation = CountingConfirmation::new(0);
    let orchestrator = UploadOrchestrator::new(
        queue.clone(),
        engine.clone(),
        confirmation.clone(),
        fast_policy(5),
        1,
    );

    let outcome = orchestrator.drain().await.unwrap();
    assert_eq!(outcome.completed, 1);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    assert_eq!(confirmation.calls.load(Ordering::SeqCst), 1);
    assert!(queue.list_all().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drains_never_double_attempt_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(UploadRequestQueue::open(dir.path().join("requests")).unwrap());
    queued_request(&queue, &dir.path().join("archive.tar.zst"));

    let engine = SlowTransfer {
        delay: Duration::from_millis(150),
        calls: Arc::new(AtomicU32::new(0)),
    };
    let confirmation = CountingConfirmation::new(0);
    let orchestrator = Arc::new(UploadOrchestrator::new(
        queue.clone(),
        engine.clone(),
        confirmation.clone(),
        fast_policy(3),
        4,
    ));

    let (first, second) = tokio::join!(orchestrator.drain(), orchestrator.drain());
    let total_completed = first.unwrap().completed + second.unwrap().completed;

    assert_eq!(total_completed, 1);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    assert_eq!(confirmation.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_end_to_end_stage_and_upload_with_real_engine() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/presigned/container")
        .match_header("content-type", "application/octet-stream")
        .with_status(200)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = UploaderConfig::new(dir.path());
    config.ensure_dirs().unwrap();

    let mut builder = ArchiveBuilder::for_survey("daily-survey", Utc::now());
    builder.app_version("version 1.2, build 9").unwrap();
    builder.device_info("integration test device").unwrap();
    builder
        .add_entry(ArchiveEntry::json(
            "answers.json",
            Utc::now(),
            serde_json::json!({"mood": 4}),
        ))
        .unwrap();
    let archive = builder.build().unwrap();

    let queue = Arc::new(UploadRequestQueue::open(config.requests_dir()).unwrap());
    let engine = TransferEngine::new(config.build_transfer_client().unwrap(), config.chunk_size);
    let orchestrator = UploadOrchestrator::new(
        queue.clone(),
        engine,
        CountingConfirmation::new(0),
        fast_policy(3),
        config.max_concurrent_uploads,
    );

    let request = orchestrator
        .stage_archive(
            &archive,
            "daily-survey.tar.zst",
            &format!("{}/presigned/container", server.url()),
            &config.archives_dir(),
        )
        .await
        .unwrap();
    assert!(request.archive_path.exists());
    assert!(!request.content_md5.is_empty());

    let outcome = orchestrator.drain().await.unwrap();
    assert_eq!(outcome.completed, 1);

    mock.assert_async().await;
    assert!(queue.list_all().unwrap().is_empty());
}
