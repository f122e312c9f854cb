use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::keys::{KeyDerivationError, StorageKey, derive_key};
use super::uploads::AttachedFile;
use crate::storage::{StoreDestination, StoreLocation};
use crate::types::RequestId;

/// Reference to one stored file, as published to the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileDescriptor {
    /// Position of the file in the request's file list
    pub index: usize,
    /// Form field name the file was attached under, verbatim
    pub name: String,
    /// Storage key of the file, relative to `bucket`
    pub key: StorageKey,
}

/// The message published for one request.
///
/// Descriptor order matches the request's file order; consumers rely on `files[i].index == i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Payload {
    pub id: RequestId,
    /// The request body, passed through untouched
    #[schema(value_type = Object)]
    pub body: serde_json::Value,
    pub files: Vec<FileDescriptor>,
    pub bucket: String,
    pub location: StoreLocation,
}

impl Payload {
    /// Build the payload for a request without touching the store.
    pub fn assemble(
        id: &RequestId,
        body: serde_json::Value,
        files: &[AttachedFile],
        destination: StoreDestination,
    ) -> Result<Self, KeyDerivationError> {
        let files = files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                Ok(FileDescriptor {
                    index,
                    name: file.field_name.clone(),
                    key: derive_key(id, index, &file.field_name)?,
                })
            })
            .collect::<Result<Vec<_>, KeyDerivationError>>()?;

        Ok(Self {
            id: id.clone(),
            body,
            files,
            bucket: destination.bucket,
            location: destination.location,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &StorageKey> {
        self.files.iter().map(|f| &f.key)
    }
}
