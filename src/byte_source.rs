use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use crate::error::UploadError;

/// Lazily-readable binary content behind an archive entry or upload payload.
///
/// Every variant can be opened any number of times, and two opens of the
/// same source yield byte-identical content. JSON values are re-encoded on
/// each open rather than cached, so a source never holds more than it was
/// constructed with.
#[derive(Debug, Clone)]
pub enum ByteSource {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    File(PathBuf),
}

impl ByteSource {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ByteSource::Bytes(bytes.into())
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        ByteSource::Json(value)
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        ByteSource::File(path.into())
    }

    /// Content length in bytes. File-backed sources probe the filesystem,
    /// JSON sources encode to measure.
    pub fn len(&self) -> Result<u64, UploadError> {
        match self {
            ByteSource::Bytes(bytes) => Ok(bytes.len() as u64),
            ByteSource::Json(value) => {
                let encoded = serde_json::to_vec(value)
                    .map_err(|err| UploadError::Io(format!("Cannot encode JSON: {err}")))?;
                Ok(encoded.len() as u64)
            }
            ByteSource::File(path) => {
                let meta = std::fs::metadata(path).map_err(|err| {
                    UploadError::Io(format!("Cannot stat {}: {err}", path.display()))
                })?;
                Ok(meta.len())
            }
        }
    }

    pub fn is_empty(&self) -> Result<bool, UploadError> {
        Ok(self.len()? == 0)
    }

    /// Opens a fresh reader over the content. Restartable: each call starts
    /// from the beginning.
    pub fn open(&self) -> Result<Box<dyn Read + Send>, UploadError> {
        match self {
            ByteSource::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            ByteSource::Json(value) => {
                let encoded = serde_json::to_vec(value)
                    .map_err(|err| UploadError::Io(format!("Cannot encode JSON: {err}")))?;
                Ok(Box::new(Cursor::new(encoded)))
            }
            ByteSource::File(path) => {
                let file = File::open(path).map_err(|err| {
                    UploadError::Io(format!("Cannot open {}: {err}", path.display()))
                })?;
                Ok(Box::new(file))
            }
        }
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>, UploadError> {
        let mut buf = Vec::new();
        self.open()?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}
