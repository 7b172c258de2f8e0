use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::UploadError;

/// Lifecycle state of a durable upload record. `AwaitingConfirmation` marks
/// requests whose bytes already reached the remote store: only the
/// confirmation step is retried, never the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    Pending,
    AwaitingConfirmation,
    Abandoned,
}

/// One pending upload, persisted as a JSON record keyed by id. Exactly one
/// live copy exists per id; re-enqueueing an id keeps `attempt_count`
/// monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub id: String,
    pub archive_filename: String,
    pub archive_path: PathBuf,
    pub content_md5: String,
    pub content_type: String,
    pub target_url: String,
    pub attempt_count: u32,
    #[serde(default)]
    pub state: RequestState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandoned_reason: Option<String>,
}

impl UploadRequest {
    pub fn new(
        archive_filename: impl Into<String>,
        archive_path: impl Into<PathBuf>,
        content_md5: impl Into<String>,
        content_type: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            archive_filename: archive_filename.into(),
            archive_path: archive_path.into(),
            content_md5: content_md5.into(),
            content_type: content_type.into(),
            target_url: target_url.into(),
            attempt_count: 0,
            state: RequestState::Pending,
            enqueued_at: Utc::now(),
            abandoned_reason: None,
        }
    }
}

/// Durable, crash-safe store of pending uploads: one JSON file per request
/// id under the storage directory. The store is the single source of truth
/// for what still needs uploading; an internal mutex linearizes mutations
/// against concurrent producers and the draining orchestrator.
pub struct UploadRequestQueue {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl UploadRequestQueue {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            UploadError::Persistence(format!("Cannot create queue dir {}: {err}", dir.display()))
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persists the request. Guaranteed recoverable after restart once this
    /// returns. Re-enqueueing an existing id keeps the stored attempt count
    /// if it is higher.
    pub fn enqueue(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let _guard = self.guard();
        let mut record = request.clone();
        if let Some(existing) = self.read_record(&self.record_path(&request.id)) {
            record.attempt_count = record.attempt_count.max(existing.attempt_count);
        }
        self.write_record(&record)
    }

    /// Rewrites an existing record (state or attempt-count changes).
    pub fn update(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let _guard = self.guard();
        self.write_record(request)
    }

    /// All records not yet completed and not abandoned, oldest first.
    /// Corrupt record files are logged and skipped, never fatal.
    ///
    /// Eagerly materialized: records are small, and every call re-reads
    /// the store so the listing restarts from durable state.
    pub fn list_pending(&self) -> Result<Vec<UploadRequest>, UploadError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|request| request.state != RequestState::Abandoned)
            .collect())
    }

    /// Every stored record, including abandoned ones kept for inspection.
    pub fn list_all(&self) -> Result<Vec<UploadRequest>, UploadError> {
        let _guard = self.guard();
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            UploadError::Persistence(format!("Cannot read queue dir {}: {err}", self.dir.display()))
        })?;

        let mut requests = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| UploadError::Persistence(err.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path) {
                Some(request) => requests.push(request),
                None => {
                    log::warn!("Skipping unreadable queue record {}", path.display());
                }
            }
        }

        requests.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(requests)
    }

    pub fn get(&self, id: &str) -> Result<Option<UploadRequest>, UploadError> {
        let _guard = self.guard();
        Ok(self.read_record(&self.record_path(id)))
    }

    /// Deletes a completed record. Only called after the remote confirmed
    /// success; removing earlier would risk silent data loss.
    pub fn remove(&self, id: &str) -> Result<(), UploadError> {
        let _guard = self.guard();
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Queue record {id} already removed");
                Ok(())
            }
            Err(err) => Err(UploadError::Persistence(format!(
                "Cannot remove queue record {id}: {err}"
            ))),
        }
    }

    fn read_record(&self, path: &Path) -> Option<UploadRequest> {
        let contents = fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn write_record(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let contents = serde_json::to_string_pretty(request)
            .map_err(|err| UploadError::Persistence(format!("Cannot encode record: {err}")))?;

        // Atomic replace: write to a temp file in the same directory, then
        // rename over the record path.
        let mut temp = NamedTempFile::new_in(&self.dir)
            .map_err(|err| UploadError::Persistence(format!("Cannot create temp record: {err}")))?;
        temp.write_all(contents.as_bytes())
            .and_then(|_| temp.flush())
            .map_err(|err| UploadError::Persistence(format!("Cannot write record: {err}")))?;
        temp.persist(self.record_path(&request.id)).map_err(|err| {
            UploadError::Persistence(format!("Cannot persist record {}: {err}", request.id))
        })?;
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
