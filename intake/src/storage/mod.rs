//! Object store gateway.
//!
//! The pipeline writes every attached file through the [`ObjectStore`] trait. Three backends exist:
//!
//! - [`s3::S3ObjectStore`]: production backend on Amazon S3 (or any S3-compatible endpoint)
//! - [`local::LocalObjectStore`]: writes objects below a directory, useful for development
//! - [`in_memory::InMemoryObjectStore`]: keeps objects in memory, used in tests
//!
//! A backend is built once at startup by [`create_object_store`] and shared read-only by all
//! in-flight requests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use utoipa::ToSchema;

use crate::config::{Config, StorageBackend};
use crate::pipeline::keys::StorageKey;

pub mod in_memory;
pub mod local;
pub mod s3;

pub use in_memory::InMemoryObjectStore;
pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

/// Errors raised while writing an object
#[derive(Error, Debug)]
pub enum StoreError {
    /// The file's own byte source could not be read
    #[error("failed to read file contents: {0}")]
    Read(#[source] std::io::Error),

    /// The store answered, but refused the write
    #[error("object store rejected {key}: {message}")]
    Rejected { key: String, message: String },

    /// The store could not be reached or failed mid-request
    #[error("object store request failed: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local filesystem write failed
    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Kind of store a payload's keys point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StoreLocation {
    S3,
    Local,
    Memory,
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::S3 => write!(f, "s3"),
            StoreLocation::Local => write!(f, "local"),
            StoreLocation::Memory => write!(f, "memory"),
        }
    }
}

/// Where a store puts its objects; copied into every published payload so consumers know where
/// to fetch the files from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StoreDestination {
    /// Bucket (or directory) name the keys are relative to
    pub bucket: String,
    pub location: StoreLocation,
}

/// Readable contents of one attached file.
///
/// Path sources are opened only when their own upload starts, and the handle is dropped as soon as
/// that upload finishes, whatever happens to sibling files.
#[derive(Debug, Clone)]
pub enum ByteSource {
    Memory(Bytes),
    File(PathBuf),
}

impl ByteSource {
    /// Open the source for streaming.
    pub async fn open(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            ByteSource::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            ByteSource::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
        }
    }

    /// Read the whole source into memory.
    pub async fn read_all(&self) -> std::io::Result<Bytes> {
        match self {
            ByteSource::Memory(bytes) => Ok(bytes.clone()),
            ByteSource::File(_) => {
                let mut reader = self.open().await?;
                let mut content = Vec::new();
                reader.read_to_end(&mut content).await?;
                Ok(Bytes::from(content))
            }
        }
    }
}

impl From<Bytes> for ByteSource {
    fn from(bytes: Bytes) -> Self {
        ByteSource::Memory(bytes)
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(bytes: Vec<u8>) -> Self {
        ByteSource::Memory(Bytes::from(bytes))
    }
}

impl From<PathBuf> for ByteSource {
    fn from(path: PathBuf) -> Self {
        ByteSource::File(path)
    }
}

/// Trait for object store backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket and location every key written by this store is relative to
    fn destination(&self) -> StoreDestination;

    /// Write the whole source under `key`, tagged with `content_type`.
    ///
    /// Returns only once the store has acknowledged the object as durable. Writing the same key
    /// twice overwrites the first object.
    async fn put_object(&self, key: &StorageKey, source: &ByteSource, content_type: &str) -> Result<()>;
}

/// Create the object store backend selected in configuration
pub async fn create_object_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match &config.storage {
        StorageBackend::S3 {
            create_bucket,
            endpoint_url,
            force_path_style,
        } => {
            tracing::info!(
                region = %config.region,
                bucket = %config.bucket,
                create_bucket = create_bucket,
                "Creating S3 object store"
            );
            let store = S3ObjectStore::connect(s3::S3Settings {
                region: &config.region,
                bucket: &config.bucket,
                create_bucket: *create_bucket,
                endpoint_url: endpoint_url.as_ref(),
                force_path_style: *force_path_style,
                operation_timeout: config.operation_timeout,
            })
            .await?;
            Ok(Arc::new(store))
        }
        StorageBackend::Local { path } => {
            tracing::info!(path = ?path, bucket = %config.bucket, "Creating local object store");
            let store = LocalObjectStore::create(path.clone(), config.bucket.clone())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create local storage directory {:?}: {}", path, e))?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory object store; stored files are lost on restart");
            Ok(Arc::new(InMemoryObjectStore::new(config.bucket.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_reads_back() {
        let source = ByteSource::from(b"hello".to_vec());
        assert_eq!(source.read_all().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_file_source_is_read_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");

        // The source can be built before the file exists; only reading requires it
        let source = ByteSource::from(path.clone());
        assert!(source.read_all().await.is_err());

        tokio::fs::write(&path, b"lazy bytes").await.unwrap();
        assert_eq!(source.read_all().await.unwrap(), Bytes::from_static(b"lazy bytes"));
    }

    #[tokio::test]
    async fn test_create_local_store_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bucket: "files".to_string(),
            storage: StorageBackend::Local {
                path: dir.path().to_path_buf(),
            },
            ..Default::default()
        };

        let store = create_object_store(&config).await.unwrap();

        assert_eq!(
            store.destination(),
            StoreDestination {
                bucket: "files".to_string(),
                location: StoreLocation::Local,
            }
        );
        assert!(dir.path().join("files").is_dir());
    }

    #[test]
    fn test_location_serialization() {
        assert_eq!(serde_json::to_value(StoreLocation::S3).unwrap(), serde_json::json!("s3"));
        assert_eq!(StoreLocation::Local.to_string(), "local");
    }
}
