use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::pipeline::{IntakeError, StorageKey};
use crate::types::RequestId;

/// A file that could not be stored
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FailedFile {
    /// Position of the file in the request
    pub index: usize,
    /// Form field the file was attached under
    pub name: String,
    /// Key the file would have been stored at
    #[schema(value_type = String)]
    pub key: StorageKey,
    pub message: String,
}

/// Error body returned when the pipeline fails after validation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IntakeErrorResponse {
    /// `invalid_request`, `upload_failed` or `publish_failed`
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub request_id: Option<RequestId>,
    /// Files that failed to upload (`upload_failed` only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedFile>,
    /// Objects that were written but are not referenced by any published message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<String>)]
    pub orphaned_keys: Vec<StorageKey>,
}

impl IntakeErrorResponse {
    pub fn from_intake_error(err: &IntakeError) -> Self {
        match err {
            IntakeError::KeyDerivation(e) => Self {
                error: err.kind().to_string(),
                message: e.to_string(),
                request_id: None,
                failures: vec![],
                orphaned_keys: vec![],
            },
            IntakeError::Upload(e) => Self {
                error: err.kind().to_string(),
                message: format!("{} of {} files could not be stored", e.failures.len(), e.failures.len() + e.stored.len()),
                request_id: Some(e.request_id.clone()),
                failures: e
                    .failures
                    .iter()
                    .map(|f| FailedFile {
                        index: f.index,
                        name: f.name.clone(),
                        key: f.key.clone(),
                        message: f.source.to_string(),
                    })
                    .collect(),
                orphaned_keys: e.stored.clone(),
            },
            IntakeError::Publish { request_id, stored, source } => Self {
                error: err.kind().to_string(),
                message: format!("files were stored but the message could not be published: {}", source),
                request_id: Some(request_id.clone()),
                failures: vec![],
                orphaned_keys: stored.clone(),
            },
        }
    }
}
