use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::byte_source::ByteSource;
use crate::error::{BuildError, UploadError};
use crate::manifest::{
    ArchiveManifest, EntryContentType, ManifestFileEntry, MANIFEST_FILENAME,
};

const CONTAINER_BUFFER_SIZE: usize = 256 * 1024;
const CONTAINER_COMPRESSION_LEVEL: i32 = 3;

/// What the archive describes: a survey response or a schema-backed task
/// result. Selected once at builder creation; the two are mutually
/// exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveKind {
    Survey {
        survey_guid: String,
        created_on: DateTime<Utc>,
    },
    Schema {
        schema_id: String,
        revision: i32,
    },
}

/// Resolves a task identifier to the schema the remote ingester files it
/// under. External collaborator; implemented by the host application.
pub trait SchemaResolver {
    fn resolve(&self, task_identifier: &str) -> Option<SchemaRef>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRef {
    pub id: String,
    pub revision: i32,
}

/// Supplies study-session context used to enrich the manifest. External
/// collaborator; implemented by the host application's session layer.
pub trait SessionProvider {
    fn data_groups(&self) -> Option<Vec<String>>;
    fn external_id(&self) -> Option<String>;
}

/// One named, timestamped payload destined for a container.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub filename: String,
    pub end_timestamp: DateTime<Utc>,
    pub content_type: EntryContentType,
    pub content: ByteSource,
}

impl ArchiveEntry {
    pub fn json(
        filename: impl Into<String>,
        end_timestamp: DateTime<Utc>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            filename: filename.into(),
            end_timestamp,
            content_type: EntryContentType::Json,
            content: ByteSource::from_json(value),
        }
    }

    pub fn binary(
        filename: impl Into<String>,
        end_timestamp: DateTime<Utc>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            end_timestamp,
            content_type: EntryContentType::Binary,
            content: ByteSource::from_bytes(bytes),
        }
    }

    pub fn from_file(
        filename: impl Into<String>,
        end_timestamp: DateTime<Utc>,
        content_type: EntryContentType,
        path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            filename: filename.into(),
            end_timestamp,
            content_type,
            content: ByteSource::from_file(path),
        }
    }
}

/// Two-phase archive construction: a mutable draft that freezes into an
/// immutable [`Archive`] on `build()`.
#[derive(Debug)]
pub struct ArchiveBuilder {
    kind: ArchiveKind,
    app_version: String,
    phone_info: String,
    data_groups: Option<Vec<String>>,
    external_id: Option<String>,
    entries: Vec<ArchiveEntry>,
    built: Option<Arc<Archive>>,
}

impl ArchiveBuilder {
    pub fn for_survey(survey_guid: impl Into<String>, created_on: DateTime<Utc>) -> Self {
        Self::new(ArchiveKind::Survey {
            survey_guid: survey_guid.into(),
            created_on,
        })
    }

    pub fn for_activity(schema_id: impl Into<String>, revision: i32) -> Self {
        Self::new(ArchiveKind::Schema {
            schema_id: schema_id.into(),
            revision,
        })
    }

    /// Resolves `task_identifier` through the schema collaborator; `None`
    /// when the task has no registered schema.
    pub fn for_task(resolver: &impl SchemaResolver, task_identifier: &str) -> Option<Self> {
        let schema = resolver.resolve(task_identifier)?;
        Some(Self::for_activity(schema.id, schema.revision))
    }

    fn new(kind: ArchiveKind) -> Self {
        Self {
            kind,
            app_version: String::new(),
            phone_info: String::new(),
            data_groups: None,
            external_id: None,
            entries: Vec::new(),
            built: None,
        }
    }

    fn ensure_mutable(&self) -> Result<(), BuildError> {
        if self.built.is_some() {
            return Err(BuildError::AlreadyBuilt);
        }
        Ok(())
    }

    pub fn app_version(&mut self, version: impl Into<String>) -> Result<&mut Self, BuildError> {
        self.ensure_mutable()?;
        self.app_version = version.into();
        Ok(self)
    }

    pub fn device_info(&mut self, info: impl Into<String>) -> Result<&mut Self, BuildError> {
        self.ensure_mutable()?;
        self.phone_info = info.into();
        Ok(self)
    }

    pub fn data_groups(&mut self, groups: Vec<String>) -> Result<&mut Self, BuildError> {
        self.ensure_mutable()?;
        self.data_groups = Some(groups);
        Ok(self)
    }

    pub fn external_id(&mut self, id: impl Into<String>) -> Result<&mut Self, BuildError> {
        self.ensure_mutable()?;
        self.external_id = Some(id.into());
        Ok(self)
    }

    /// Copies data groups and external id from the session collaborator.
    pub fn apply_session(&mut self, session: &impl SessionProvider) -> Result<&mut Self, BuildError> {
        self.ensure_mutable()?;
        self.data_groups = session.data_groups();
        self.external_id = session.external_id();
        Ok(self)
    }

    /// Appends an entry. Filenames must be unique within the container and
    /// `info.json` is reserved; collisions are rejected rather than
    /// overwritten so a miswired producer fails fast.
    pub fn add_entry(&mut self, entry: ArchiveEntry) -> Result<&mut Self, BuildError> {
        self.ensure_mutable()?;
        if entry.filename == MANIFEST_FILENAME {
            return Err(BuildError::ReservedFilename(entry.filename));
        }
        if self.entries.iter().any(|e| e.filename == entry.filename) {
            return Err(BuildError::DuplicateFilename(entry.filename));
        }
        self.entries.push(entry);
        Ok(self)
    }

    /// Freezes the manifest and returns the immutable archive. Idempotent:
    /// a second call returns the same archive without duplicating
    /// `info.json`.
    pub fn build(&mut self) -> Result<Arc<Archive>, UploadError> {
        if let Some(archive) = &self.built {
            return Ok(archive.clone());
        }

        let (item, schema_revision, created_on) = match &self.kind {
            ArchiveKind::Survey {
                survey_guid,
                created_on,
            } => (survey_guid.clone(), None, Some(*created_on)),
            ArchiveKind::Schema {
                schema_id,
                revision,
            } => (schema_id.clone(), Some(*revision), None),
        };

        let mut entries = std::mem::take(&mut self.entries);
        let manifest = ArchiveManifest {
            app_version: self.app_version.clone(),
            phone_info: self.phone_info.clone(),
            item,
            schema_revision,
            created_on,
            data_groups: self.data_groups.clone(),
            external_id: self.external_id.clone(),
            files: entries
                .iter()
                .map(|entry| ManifestFileEntry {
                    filename: entry.filename.clone(),
                    timestamp: entry.end_timestamp,
                    content_type: entry.content_type,
                })
                .collect(),
        };

        let manifest_written_at = Utc::now();
        entries.push(ArchiveEntry {
            filename: MANIFEST_FILENAME.to_string(),
            end_timestamp: manifest_written_at,
            content_type: EntryContentType::Json,
            content: manifest.to_byte_source()?,
        });

        let archive = Arc::new(Archive { manifest, entries });
        self.built = Some(archive.clone());
        Ok(archive)
    }
}

/// A finalized container: ordered entries plus the frozen manifest.
/// Immutable and safe to share across workers.
#[derive(Debug)]
pub struct Archive {
    manifest: ArchiveManifest,
    entries: Vec<ArchiveEntry>,
}

impl Archive {
    pub fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    /// All container entries in write order, `info.json` last.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Serializes the container to `path` as a zstd-compressed tar. Writes
    /// to a temp file in the target directory and renames on success so a
    /// failed write never leaves a partial container at `path`. Returns the
    /// compressed size.
    pub fn write_to(&self, path: &Path) -> Result<u64, UploadError> {
        let dir = path
            .parent()
            .ok_or_else(|| UploadError::Io(format!("No parent directory for {}", path.display())))?;
        std::fs::create_dir_all(dir)
            .map_err(|err| UploadError::Io(format!("Cannot create {}: {err}", dir.display())))?;

        let temp_file = NamedTempFile::new_in(dir)
            .map_err(|err| UploadError::Io(format!("Cannot create temp container: {err}")))?;

        self.write_container(temp_file.as_file())
            .map_err(|err| UploadError::Build(BuildError::PartialArchive(err.to_string())))?;

        let final_file = temp_file
            .persist(path)
            .map_err(|err| UploadError::Io(format!("Cannot persist container: {err}")))?;
        let size = final_file
            .metadata()
            .map_err(|err| UploadError::Io(err.to_string()))?
            .len();

        log::debug!(
            "Wrote container {} ({} entries, {})",
            path.display(),
            self.entries.len(),
            crate::types::ByteSize::new(size)
        );
        Ok(size)
    }

    /// Async wrapper: serializes on the blocking pool and returns the
    /// compressed size. Used by the orchestrator when staging uploads.
    pub async fn write_to_path(self: Arc<Self>, path: &Path) -> Result<u64, UploadError> {
        let archive = self;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || archive.write_to(&path))
            .await
            .map_err(|err| UploadError::Io(format!("Container write task failed: {err}")))?
    }

    fn write_container(&self, file: &File) -> anyhow::Result<()> {
        let writer = BufWriter::with_capacity(CONTAINER_BUFFER_SIZE, file);
        let mut encoder = ZstdEncoder::new(writer, CONTAINER_COMPRESSION_LEVEL)
            .context("Failed to initialize compressor")?;
        encoder
            .include_checksum(true)
            .context("Failed to enable container checksum")?;

        let mut tar_builder = tar::Builder::new(encoder);
        tar_builder.mode(tar::HeaderMode::Deterministic);

        for entry in &self.entries {
            let size = entry
                .content
                .len()
                .with_context(|| format!("Unreadable entry '{}'", entry.filename))?;
            let reader = entry
                .content
                .open()
                .with_context(|| format!("Unreadable entry '{}'", entry.filename))?;

            let mut header = tar::Header::new_gnu();
            header.set_size(size);
            header.set_mode(0o644);
            header.set_mtime(entry.end_timestamp.timestamp().max(0) as u64);

            tar_builder
                .append_data(&mut header, &entry.filename, reader)
                .with_context(|| format!("Failed to write entry '{}'", entry.filename))?;
        }

        let encoder = tar_builder
            .into_inner()
            .context("Failed to finish container")?;
        let mut writer = encoder.finish().context("Failed to finish compression")?;
        writer.flush().context("Failed to flush container")?;
        Ok(())
    }
}
