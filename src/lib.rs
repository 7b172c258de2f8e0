//! Offline-durable archive upload pipeline for research task results.
//!
//! Task results are packaged into a checksummed, compressed container with
//! a generated `info.json` manifest, persisted as durable upload requests
//! that survive process restarts, and driven through a multi-step transfer
//! (checksum, PUT, confirmation, dequeue) with retry and integrity
//! verification.

pub mod arbiter;
pub mod archive;
pub mod byte_source;
pub mod config;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod transfer;
pub mod types;

pub use arbiter::{ArbiterHandle, CallArbiter, Canceller, ResponseFuture};
pub use archive::{
    Archive, ArchiveBuilder, ArchiveEntry, ArchiveKind, SchemaRef, SchemaResolver,
    SessionProvider,
};
pub use byte_source::ByteSource;
pub use config::UploaderConfig;
pub use error::{BuildError, UploadError};
pub use manifest::{ArchiveManifest, EntryContentType, ManifestFileEntry, MANIFEST_FILENAME};
pub use orchestrator::{
    ConfirmationService, DrainOutcome, RetryPolicy, TransferStep, UploadOrchestrator,
};
pub use progress::TransferProgress;
pub use queue::{RequestState, UploadRequest, UploadRequestQueue};
pub use transfer::{TransferCall, TransferEngine};
