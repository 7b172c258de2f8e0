use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::sleep;

use crate::archive::Archive;
use crate::byte_source::ByteSource;
use crate::error::UploadError;
use crate::progress::TransferProgress;
use crate::queue::{RequestState, UploadRequest, UploadRequestQueue};
use crate::transfer::{compute_content_md5, TransferEngine, DEFAULT_CHUNK_SIZE};

/// Content type of the serialized container body.
pub const CONTAINER_CONTENT_TYPE: &str = "application/octet-stream";

/// Remote acknowledgment step, called after the raw bytes are transferred.
/// External collaborator; implemented against the study platform's API.
pub trait ConfirmationService: Send + Sync {
    fn confirm_upload(&self, id: &str) -> impl Future<Output = Result<(), UploadError>> + Send;
}

/// The transfer step the orchestrator drives. [`TransferEngine`] is the
/// production implementation; tests substitute failure-injecting doubles.
pub trait TransferStep: Send + Sync {
    fn transfer(
        &self,
        request: &UploadRequest,
        payload: &ByteSource,
        progress: &TransferProgress,
    ) -> impl Future<Output = Result<(), UploadError>> + Send;
}

impl TransferStep for TransferEngine {
    async fn transfer(
        &self,
        request: &UploadRequest,
        payload: &ByteSource,
        progress: &TransferProgress,
    ) -> Result<(), UploadError> {
        self.upload(request, payload, progress).await
    }
}

/// Injected retry policy: attempt budget and exponential backoff curve.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        backoff.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessStatus {
    Completed,
    Requeued,
    Abandoned,
}

/// Tally of one drain pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub completed: usize,
    pub requeued: usize,
    pub abandoned: usize,
}

/// Top-level control loop: drains the durable queue, drives each request
/// through transfer and confirmation, and applies the retry policy.
///
/// Within one request the steps are strictly sequential (checksum, transfer,
/// confirm, dequeue); distinct requests run concurrently up to
/// `max_concurrent`, with mutual exclusion per request id so no id ever has
/// two simultaneous attempts.
pub struct UploadOrchestrator<T: TransferStep, C: ConfirmationService> {
    queue: Arc<UploadRequestQueue>,
    engine: T,
    confirmation: C,
    retry: RetryPolicy,
    max_concurrent: usize,
    in_flight: Mutex<HashSet<String>>,
}

impl<T: TransferStep, C: ConfirmationService> UploadOrchestrator<T, C> {
    pub fn new(
        queue: Arc<UploadRequestQueue>,
        engine: T,
        confirmation: C,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            queue,
            engine,
            confirmation,
            retry,
            max_concurrent: max_concurrent.max(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &Arc<UploadRequestQueue> {
        &self.queue
    }

    /// Serializes a built archive into `archives_dir`, computes its
    /// checksum, and enqueues a durable upload request for it.
    pub async fn stage_archive(
        &self,
        archive: &Arc<Archive>,
        archive_filename: &str,
        target_url: &str,
        archives_dir: &Path,
    ) -> Result<UploadRequest, UploadError> {
        let container_path = archives_dir.join(archive_filename);
        archive.clone().write_to_path(&container_path).await?;

        let digest =
            compute_content_md5(ByteSource::from_file(&container_path), DEFAULT_CHUNK_SIZE).await?;
        let request = UploadRequest::new(
            archive_filename,
            container_path,
            digest,
            CONTAINER_CONTENT_TYPE,
            target_url,
        );
        self.queue.enqueue(&request)?;
        log::info!(
            "Staged upload {} for {}",
            request.id,
            request.archive_filename
        );
        Ok(request)
    }

    /// One pass over the queue: every pending request not already in
    /// flight is driven to completion, requeued for a later pass, or
    /// abandoned.
    pub async fn drain(&self) -> Result<DrainOutcome, UploadError> {
        let pending = self.queue.list_pending()?;
        let claimed: Vec<UploadRequest> = pending
            .into_iter()
            .filter(|request| self.try_claim(&request.id))
            .collect();

        let statuses = futures_util::stream::iter(claimed.into_iter().map(|request| async move {
            let id = request.id.clone();
            let status = self.process(request).await;
            self.release(&id);
            status
        }))
        .buffer_unordered(self.max_concurrent)
        .collect::<Vec<_>>()
        .await;

        let mut outcome = DrainOutcome::default();
        for status in statuses {
            match status {
                ProcessStatus::Completed => outcome.completed += 1,
                ProcessStatus::Requeued => outcome.requeued += 1,
                ProcessStatus::Abandoned => outcome.abandoned += 1,
            }
        }
        Ok(outcome)
    }

    async fn process(&self, mut request: UploadRequest) -> ProcessStatus {
        let mut last_error: Option<UploadError> = None;

        loop {
            if request.attempt_count >= self.retry.max_attempts {
                let reason = last_error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "retry budget exhausted".to_string());
                return self.abandon(request, reason);
            }

            request.attempt_count += 1;
            if let Err(err) = self.queue.update(&request) {
                log::error!("Cannot persist attempt for {}: {err}", request.id);
                return ProcessStatus::Requeued;
            }

            if request.state != RequestState::AwaitingConfirmation {
                let payload = ByteSource::from_file(&request.archive_path);
                let total_bytes = payload.len().unwrap_or(0);
                let progress = TransferProgress::new(total_bytes);

                match self.engine.transfer(&request, &payload, &progress).await {
                    Ok(()) => {
                        // Bytes are on the remote store now. Persist that
                        // before confirming, so a crash here retries
                        // confirmation only, never the transfer.
                        request.state = RequestState::AwaitingConfirmation;
                        if let Err(err) = self.queue.update(&request) {
                            log::error!(
                                "Cannot persist confirmation state for {}: {err}",
                                request.id
                            );
                        }
                    }
                    Err(UploadError::Cancelled) => {
                        log::info!("Upload {} cancelled; left queued", request.id);
                        return ProcessStatus::Requeued;
                    }
                    Err(err) if err.is_retryable() => {
                        log::warn!(
                            "Upload {} attempt {} failed, will retry: {err}",
                            request.id,
                            request.attempt_count
                        );
                        sleep(self.retry.delay_for(request.attempt_count)).await;
                        last_error = Some(err);
                        continue;
                    }
                    Err(err) => {
                        return self.abandon(request, err.to_string());
                    }
                }
            }

            match self.confirmation.confirm_upload(&request.id).await {
                Ok(()) => {
                    if let Err(err) = self.queue.remove(&request.id) {
                        log::error!("Upload {} confirmed but not dequeued: {err}", request.id);
                        return ProcessStatus::Requeued;
                    }
                    log::info!(
                        "Upload {} completed after {} attempt(s)",
                        request.id,
                        request.attempt_count
                    );
                    return ProcessStatus::Completed;
                }
                Err(err) => {
                    log::warn!(
                        "Confirmation for {} failed on attempt {}: {err}",
                        request.id,
                        request.attempt_count
                    );
                    sleep(self.retry.delay_for(request.attempt_count)).await;
                    last_error = Some(err);
                }
            }
        }
    }

    fn abandon(&self, mut request: UploadRequest, reason: String) -> ProcessStatus {
        log::error!(
            "Upload {} abandoned after {} attempt(s): {reason}",
            request.id,
            request.attempt_count
        );
        request.state = RequestState::Abandoned;
        request.abandoned_reason = Some(reason);
        // Kept in the store for inspection and manual retry, never
        // silently dropped.
        if let Err(err) = self.queue.update(&request) {
            log::error!("Cannot persist abandoned state for {}: {err}", request.id);
        }
        ProcessStatus::Abandoned
    }

    fn try_claim(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }
}
