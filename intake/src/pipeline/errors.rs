use thiserror::Error;

use super::keys::{KeyDerivationError, StorageKey};
use crate::queue::QueueError;
use crate::storage::StoreError;
use crate::types::RequestId;

/// One file that could not be stored
#[derive(Error, Debug)]
#[error("file {index} ({name}) could not be stored at {key}: {source}")]
pub struct FileUploadFailure {
    pub index: usize,
    pub name: String,
    pub key: StorageKey,
    #[source]
    pub source: StoreError,
}

/// At least one upload of a request failed; nothing was published.
#[derive(Error, Debug)]
#[error(
    "{} of {} uploads failed for request {request_id}: {}",
    .failures.len(),
    .failures.len() + .stored.len(),
    describe_failures(.failures)
)]
pub struct UploadError {
    pub request_id: RequestId,
    /// Failed files, ordered by index
    pub failures: Vec<FileUploadFailure>,
    /// Keys that were written anyway and are now unreferenced
    pub stored: Vec<StorageKey>,
}

fn describe_failures(failures: &[FileUploadFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.key, f.source))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors returned by [`RequestHandler::handle`](super::RequestHandler::handle)
#[derive(Error, Debug)]
pub enum IntakeError {
    /// Malformed request id or field name; no I/O was attempted
    #[error("invalid request: {0}")]
    KeyDerivation(#[from] KeyDerivationError),

    /// One or more uploads failed; the queue was not touched
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Every file was stored but the message could not be published. The stored objects are
    /// unreferenced until the request is resubmitted.
    #[error("files for request {request_id} were stored but publishing failed: {source}")]
    Publish {
        request_id: RequestId,
        stored: Vec<StorageKey>,
        #[source]
        source: QueueError,
    },
}

impl IntakeError {
    /// Short machine-readable name, used in responses and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            IntakeError::KeyDerivation(_) => "invalid_request",
            IntakeError::Upload(_) => "upload_failed",
            IntakeError::Publish { .. } => "publish_failed",
        }
    }
}
