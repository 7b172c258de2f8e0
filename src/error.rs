use std::fmt;

/// Archive construction failures. Structural: never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    DuplicateFilename(String),
    ReservedFilename(String),
    AlreadyBuilt,
    PartialArchive(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::DuplicateFilename(name) => {
                write!(f, "Archive already contains an entry named '{name}'")
            }
            BuildError::ReservedFilename(name) => {
                write!(f, "'{name}' is reserved for the generated manifest")
            }
            BuildError::AlreadyBuilt => {
                write!(f, "Archive has been built and can no longer be modified")
            }
            BuildError::PartialArchive(msg) => {
                write!(f, "Archive write aborted: {msg}")
            }
        }
    }
}

impl std::error::Error for BuildError {}

#[derive(Debug)]
pub enum UploadError {
    Build(BuildError),
    Io(String),
    Persistence(String),
    Transport {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },
    Integrity(String),
    Confirmation(String),
    RetryBudgetExhausted {
        id: String,
        attempts: u32,
        last_error: String,
    },
    Cancelled,
}

impl UploadError {
    pub fn transport(status: Option<u16>, message: impl Into<String>, retryable: bool) -> Self {
        UploadError::Transport {
            status,
            message: message.into(),
            retryable,
        }
    }

    /// Whether the orchestrator may retry this failure with backoff.
    ///
    /// Integrity failures count as retryable because the transfer engine
    /// re-derives the payload and its checksum on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Transport { retryable, .. } => *retryable,
            UploadError::Confirmation(_) => true,
            UploadError::Integrity(_) => true,
            UploadError::Build(_)
            | UploadError::Io(_)
            | UploadError::Persistence(_)
            | UploadError::RetryBudgetExhausted { .. }
            | UploadError::Cancelled => false,
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Build(err) => write!(f, "{err}"),
            UploadError::Io(msg) => write!(f, "IO error: {msg}"),
            UploadError::Persistence(msg) => write!(f, "Queue persistence error: {msg}"),
            UploadError::Transport {
                status, message, ..
            } => match status {
                Some(code) => write!(f, "Transfer failed: HTTP {code} - {message}"),
                None => write!(f, "Transfer failed: {message}"),
            },
            UploadError::Integrity(msg) => {
                write!(f, "Remote rejected content checksum: {msg}")
            }
            UploadError::Confirmation(msg) => {
                write!(f, "Upload confirmation failed: {msg}")
            }
            UploadError::RetryBudgetExhausted {
                id,
                attempts,
                last_error,
            } => write!(
                f,
                "Upload {id} abandoned after {attempts} attempts: {last_error}"
            ),
            UploadError::Cancelled => write!(f, "Upload cancelled"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<BuildError> for UploadError {
    fn from(err: BuildError) -> Self {
        UploadError::Build(err)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::Persistence(format!("JSON encoding error: {err}"))
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout()
            || err.is_connect()
            || err
                .status()
                .map(is_retryable_status)
                .unwrap_or(false);
        UploadError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            retryable,
        }
    }
}

pub(crate) fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
}
