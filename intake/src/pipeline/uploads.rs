//! Upload coordination: one put-object per attached file, all in flight together, joined before
//! anything is published.

use futures::{StreamExt, stream};

use super::errors::{FileUploadFailure, IntakeError, UploadError};
use super::keys::{StorageKey, derive_key};
use crate::storage::{ByteSource, ObjectStore};
use crate::types::RequestId;

/// A file attached to an intake request. Its ordinal is its position in the request's file list.
#[derive(Debug, Clone)]
pub struct AttachedFile {
    /// Form field the file was attached under. Not unique across a request.
    pub field_name: String,
    pub content_type: String,
    pub source: ByteSource,
}

impl AttachedFile {
    pub fn new(field_name: impl Into<String>, content_type: impl Into<String>, source: impl Into<ByteSource>) -> Self {
        Self {
            field_name: field_name.into(),
            content_type: content_type.into(),
            source: source.into(),
        }
    }
}

/// Store every file under its derived key.
///
/// Keys are derived for all files before the first write, so malformed input never causes partial
/// uploads. Writes are then issued concurrently (at most `max_concurrency` at a time, all at once
/// when unset) and every write is awaited before returning, even after a failure: the returned
/// error lists each file that failed and each key that was nonetheless stored.
///
/// On success the keys are returned in file order.
pub async fn upload_all(
    store: &dyn ObjectStore,
    request_id: &RequestId,
    files: &[AttachedFile],
    max_concurrency: Option<usize>,
) -> Result<Vec<StorageKey>, IntakeError> {
    let keys = files
        .iter()
        .enumerate()
        .map(|(index, file)| derive_key(request_id, index, &file.field_name))
        .collect::<Result<Vec<_>, _>>()?;

    if files.is_empty() {
        return Ok(keys);
    }

    let limit = max_concurrency.unwrap_or(files.len()).max(1);

    // Futures are built up front so the stream holds concrete borrows, keeping it Send
    let uploads: Vec<_> = files
        .iter()
        .zip(keys.iter())
        .enumerate()
        .map(|(index, (file, key))| async move {
            tracing::trace!(index, key = %key, content_type = %file.content_type, "Starting upload");
            (index, store.put_object(key, &file.source, &file.content_type).await)
        })
        .collect();

    let mut outcomes: Vec<_> = stream::iter(uploads).buffer_unordered(limit).collect().await;
    outcomes.sort_by_key(|(index, _)| *index);

    let mut stored = Vec::with_capacity(files.len());
    let mut failures = Vec::new();

    for ((index, outcome), key) in outcomes.into_iter().zip(keys) {
        match outcome {
            Ok(()) => {
                metrics::counter!("intake_files_uploaded_total").increment(1);
                stored.push(key);
            }
            Err(source) => {
                metrics::counter!("intake_file_upload_failures_total").increment(1);
                tracing::warn!(
                    request_id = %request_id,
                    index,
                    key = %key,
                    error = %source,
                    "Upload failed"
                );
                failures.push(FileUploadFailure {
                    index,
                    name: files[index].field_name.clone(),
                    key,
                    source,
                });
            }
        }
    }

    if failures.is_empty() {
        tracing::debug!(request_id = %request_id, count = stored.len(), "All uploads acknowledged");
        Ok(stored)
    } else {
        Err(UploadError {
            request_id: request_id.clone(),
            failures,
            stored,
        }
        .into())
    }
}
