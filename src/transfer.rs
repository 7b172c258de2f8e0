use std::io::Read;

use reqwest::Client;
use tokio_stream::wrappers::ReceiverStream;

use crate::arbiter::{CallArbiter, Canceller, ResponseFuture};
use crate::byte_source::ByteSource;
use crate::error::{is_retryable_status, UploadError};
use crate::progress::TransferProgress;
use crate::queue::UploadRequest;
use crate::types::ByteSize;

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Executes one upload request against its pre-authorized target: streams
/// the payload in fixed-size chunks with a fresh per-attempt checksum and
/// the integrity headers the remote store verifies.
#[derive(Clone)]
pub struct TransferEngine {
    client: Client,
    chunk_size: usize,
}

/// An in-flight transfer: the awaitable outcome plus its cancellation side.
/// Cancelling aborts the underlying PUT; the response resolves to
/// [`UploadError::Cancelled`].
pub struct TransferCall {
    pub response: ResponseFuture<()>,
    pub canceller: Canceller<()>,
}

impl TransferEngine {
    pub fn new(client: Client, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    /// One transfer attempt, awaited to completion. See [`Self::start_upload`]
    /// for the cancellable form.
    pub async fn upload(
        &self,
        request: &UploadRequest,
        payload: &ByteSource,
        progress: &TransferProgress,
    ) -> Result<(), UploadError> {
        self.start_upload(request.clone(), payload.clone(), progress.clone())
            .response
            .await
    }

    /// Starts a transfer attempt on the runtime and bridges it through a
    /// call arbiter, so the caller can await or cancel it.
    pub fn start_upload(
        &self,
        request: UploadRequest,
        payload: ByteSource,
        progress: TransferProgress,
    ) -> TransferCall {
        let (handle, response, canceller) = CallArbiter::channel::<()>();
        let client = self.client.clone();
        let chunk_size = self.chunk_size;

        let task = tokio::spawn(async move {
            let outcome = execute_put(client, chunk_size, request, payload, progress).await;
            handle.fulfill(outcome);
        });

        let abort = task.abort_handle();
        canceller.set_abort(move || abort.abort());

        TransferCall {
            response,
            canceller,
        }
    }
}

async fn execute_put(
    client: Client,
    chunk_size: usize,
    request: UploadRequest,
    payload: ByteSource,
    progress: TransferProgress,
) -> Result<(), UploadError> {
    let total_bytes = payload.len()?;

    // Recompute per attempt: never trust a stale digest if the payload
    // source could have changed since enqueue.
    let digest = compute_content_md5(payload.clone(), chunk_size).await?;
    if !request.content_md5.is_empty() && request.content_md5 != digest {
        log::warn!(
            "Recomputed checksum for {} differs from enqueued digest; sending fresh value",
            request.id
        );
    }

    log::debug!(
        "Uploading {} ({}) to {}",
        request.archive_filename,
        ByteSize::new(total_bytes),
        request.target_url
    );

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, std::io::Error>>(4);
    let reader_payload = payload.clone();
    let reader_progress = progress.clone();
    let read_task = tokio::task::spawn_blocking(move || {
        let mut reader = match reader_payload.open() {
            Ok(reader) => reader,
            Err(err) => {
                let _ = tx.blocking_send(Err(std::io::Error::other(err.to_string())));
                return;
            }
        };
        let mut buffer = vec![0u8; chunk_size];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => return,
                Ok(n) => {
                    if tx.blocking_send(Ok(buffer[..n].to_vec())).is_err() {
                        return;
                    }
                    reader_progress.record_bytes(n as u64);
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            }
        }
    });

    let response = client
        .put(&request.target_url)
        .header("Content-MD5", &digest)
        .header(reqwest::header::CONTENT_TYPE, &request.content_type)
        .header(reqwest::header::CONTENT_LENGTH, total_bytes.to_string())
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
        .send()
        .await
        .map_err(UploadError::from)?;

    let _ = read_task.await;

    classify_response(response).await
}

async fn classify_response(response: reqwest::Response) -> Result<(), UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    if is_integrity_rejection(status, &body) {
        return Err(UploadError::Integrity(format!(
            "HTTP {status}: {}",
            if body.is_empty() {
                "checksum rejected"
            } else {
                body.as_str()
            }
        )));
    }

    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("Unknown error").to_string()
    } else {
        body
    };
    Err(UploadError::transport(
        Some(status.as_u16()),
        message,
        is_retryable_status(status),
    ))
}

fn is_integrity_rejection(status: reqwest::StatusCode, body: &str) -> bool {
    if status == reqwest::StatusCode::PRECONDITION_FAILED {
        return true;
    }
    if status == reqwest::StatusCode::BAD_REQUEST {
        let lower = body.to_lowercase();
        return lower.contains("md5") || lower.contains("checksum") || lower.contains("digest");
    }
    false
}

/// Streams the payload through an MD5 context on the blocking pool and
/// returns the base64 digest the `Content-MD5` header carries.
pub async fn compute_content_md5(
    payload: ByteSource,
    chunk_size: usize,
) -> Result<String, UploadError> {
    tokio::task::spawn_blocking(move || {
        let mut reader = payload.open()?;
        let mut context = md5::Context::new();
        let mut buffer = vec![0u8; chunk_size.max(1)];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => context.consume(&buffer[..n]),
                Err(err) => return Err(UploadError::Io(err.to_string())),
            }
        }
        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            context.compute().0,
        ))
    })
    .await
    .map_err(|err| UploadError::Io(format!("Checksum task failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_for(url: String) -> UploadRequest {
        UploadRequest::new(
            "archive.tar.zst",
            "/unused/archive.tar.zst",
            "",
            "application/octet-stream",
            url,
        )
    }

    #[tokio::test]
    async fn test_content_md5_matches_known_digest() {
        // MD5("hello") = 5d41402abc4b2a76b9719d911017c592
        let digest = compute_content_md5(ByteSource::from_bytes(b"hello".to_vec()), 2)
            .await
            .unwrap();
        assert_eq!(digest, "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[tokio::test]
    async fn test_successful_put_sends_integrity_headers() {
        let mut server = mockito::Server::new_async().await;
        let expected_md5 =
            compute_content_md5(ByteSource::from_bytes(vec![1u8, 2, 3, 4]), 2)
                .await
                .unwrap();
        let mock = server
            .mock("PUT", "/upload")
            .match_header("content-md5", expected_md5.as_str())
            .match_header("content-type", "application/octet-stream")
            .match_header("content-length", "4")
            .with_status(200)
            .create_async()
            .await;

        let engine = TransferEngine::new(Client::new(), 2);
        let progress = TransferProgress::new(4);
        let request = request_for(format!("{}/upload", server.url()));

        engine
            .upload(&request, &ByteSource::from_bytes(vec![1u8, 2, 3, 4]), &progress)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(progress.transferred_bytes(), 4);
    }

    #[tokio::test]
    async fn test_precondition_failed_classifies_as_integrity_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/upload")
            .with_status(412)
            .with_body("Content-MD5 mismatch")
            .create_async()
            .await;

        let engine = TransferEngine::new(Client::new(), DEFAULT_CHUNK_SIZE);
        let request = request_for(format!("{}/upload", server.url()));
        let err = engine
            .upload(
                &request,
                &ByteSource::from_bytes(vec![9u8; 16]),
                &TransferProgress::noop(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_transport_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/upload")
            .with_status(503)
            .create_async()
            .await;

        let engine = TransferEngine::new(Client::new(), DEFAULT_CHUNK_SIZE);
        let request = request_for(format!("{}/upload", server.url()));
        let err = engine
            .upload(
                &request,
                &ByteSource::from_bytes(vec![1u8]),
                &TransferProgress::noop(),
            )
            .await
            .unwrap_err();

        match err {
            UploadError::Transport {
                status, retryable, ..
            } => {
                assert_eq!(status, Some(503));
                assert!(retryable);
            }
            other => panic!("expected transport error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_forbidden_is_permanent_transport_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/upload")
            .with_status(403)
            .create_async()
            .await;

        let engine = TransferEngine::new(Client::new(), DEFAULT_CHUNK_SIZE);
        let request = request_for(format!("{}/upload", server.url()));
        let err = engine
            .upload(
                &request,
                &ByteSource::from_bytes(vec![1u8]),
                &TransferProgress::noop(),
            )
            .await
            .unwrap_err();

        match err {
            UploadError::Transport { retryable, .. } => assert!(!retryable),
            other => panic!("expected transport error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_put() {
        // A listener that accepts and never answers keeps the PUT in
        // flight until cancellation.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });

        let engine = TransferEngine::new(Client::new(), DEFAULT_CHUNK_SIZE);
        let request = request_for(format!("http://{addr}/upload"));
        let call = engine.start_upload(
            request,
            ByteSource::from_bytes(vec![0u8; 64]),
            TransferProgress::noop(),
        );

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        call.canceller.cancel();

        assert!(matches!(call.response.await, Err(UploadError::Cancelled)));
        server.abort();
    }
}
