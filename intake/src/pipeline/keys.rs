//! Storage key derivation.
//!
//! Every attached file is stored under `<request-id>/<ordinal>_<field-name>`. The ordinal keeps keys
//! distinct when several files share a field name, and derivation is a pure function of its inputs
//! so a resubmitted request writes to exactly the same locations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use utoipa::ToSchema;

use crate::types::RequestId;

/// Maximum object key length accepted by S3-compatible stores, in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Location of one stored file inside the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = String, example = "abc123/0_avatar")]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Malformed input to [`derive_key`]. Raised before any I/O happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyDerivationError {
    #[error("request id must not be empty")]
    EmptyRequestId,

    #[error("request id {id:?} {reason}")]
    InvalidRequestId { id: String, reason: &'static str },

    #[error("field name of file {index} must not be empty")]
    EmptyFieldName { index: usize },

    #[error("field name {name:?} of file {index} {reason}")]
    InvalidFieldName {
        index: usize,
        name: String,
        reason: &'static str,
    },

    #[error("storage key for file {index} is {length} bytes, exceeding the {} byte limit", MAX_KEY_LENGTH)]
    KeyTooLong { index: usize, length: usize },
}

/// Derive the storage key for the file at `index` in the request's file list.
pub fn derive_key(request_id: &RequestId, index: usize, field_name: &str) -> Result<StorageKey, KeyDerivationError> {
    validate_request_id(request_id.as_str())?;
    validate_field_name(index, field_name)?;

    let key = format!("{}/{}_{}", request_id, index, field_name);
    if key.len() > MAX_KEY_LENGTH {
        return Err(KeyDerivationError::KeyTooLong { index, length: key.len() });
    }

    Ok(StorageKey(key))
}

fn validate_request_id(id: &str) -> Result<(), KeyDerivationError> {
    if id.is_empty() {
        return Err(KeyDerivationError::EmptyRequestId);
    }

    let reason = if id.contains('/') {
        Some("must not contain '/'")
    } else if id == "." || id == ".." {
        Some("must not be a relative path component")
    } else if id.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(KeyDerivationError::InvalidRequestId { id: id.to_string(), reason }),
        None => Ok(()),
    }
}

fn validate_field_name(index: usize, name: &str) -> Result<(), KeyDerivationError> {
    if name.is_empty() {
        return Err(KeyDerivationError::EmptyFieldName { index });
    }

    let reason = if name.contains('/') {
        Some("must not contain '/'")
    } else if name.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(KeyDerivationError::InvalidFieldName {
            index,
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
