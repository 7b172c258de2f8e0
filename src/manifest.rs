use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::byte_source::ByteSource;
use crate::error::UploadError;

/// Reserved name of the generated manifest entry inside every container.
pub const MANIFEST_FILENAME: &str = "info.json";

/// Content type of an archive entry, serialized as the MIME type the remote
/// ingester expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryContentType {
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/octet-stream")]
    Binary,
}

impl EntryContentType {
    pub fn as_mime(&self) -> &'static str {
        match self {
            EntryContentType::Json => "application/json",
            EntryContentType::Binary => "application/octet-stream",
        }
    }
}

/// One `files` element in the manifest. Key names are a wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFileEntry {
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "contentType")]
    pub content_type: EntryContentType,
}

/// The generated `info.json`, describing the archive's contents and study
/// context. Produced only by `ArchiveBuilder::build`; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    #[serde(rename = "appVersion")]
    pub app_version: String,
    #[serde(rename = "phoneInfo")]
    pub phone_info: String,
    pub item: String,
    #[serde(rename = "schemaRevision", default, skip_serializing_if = "Option::is_none")]
    pub schema_revision: Option<i32>,
    #[serde(rename = "createdOn", default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(rename = "dataGroups", default, skip_serializing_if = "Option::is_none")]
    pub data_groups: Option<Vec<String>>,
    #[serde(rename = "externalId", default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub files: Vec<ManifestFileEntry>,
}

impl ArchiveManifest {
    /// Serializes the manifest into the byte source backing the `info.json`
    /// container entry.
    pub fn to_byte_source(&self) -> Result<ByteSource, UploadError> {
        Ok(ByteSource::Json(serde_json::to_value(self)?))
    }
}
