use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ByteSource, ObjectStore, Result, StoreDestination, StoreError, StoreLocation};
use crate::pipeline::keys::StorageKey;

/// Local filesystem object store - writes objects below `<base_path>/<bucket>/`
/// Useful for development and testing
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
}

impl LocalObjectStore {
    pub fn new(base_path: PathBuf, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            root: base_path.join(&bucket),
            bucket,
        }
    }

    /// Create the store, making sure its bucket directory exists
    pub async fn create(base_path: PathBuf, bucket: impl Into<String>) -> std::io::Result<Self> {
        let store = Self::new(base_path, bucket);
        fs::create_dir_all(&store.root).await?;
        Ok(store)
    }

    /// Filesystem path an object key maps to
    pub fn object_path(&self, key: &StorageKey) -> PathBuf {
        self.root.join(key.as_str())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn destination(&self) -> StoreDestination {
        StoreDestination {
            bucket: self.bucket.clone(),
            location: StoreLocation::Local,
        }
    }

    async fn put_object(&self, key: &StorageKey, source: &ByteSource, content_type: &str) -> Result<()> {
        let full_path = self.object_path(key);

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Stage next to the target so a failed read never leaves a truncated object behind
        let staging_path = staging_path(&full_path);
        let written = write_object(&staging_path, source).await;
        if let Err(e) = written {
            let _ = fs::remove_file(&staging_path).await;
            return Err(e);
        }
        fs::rename(&staging_path, &full_path).await?;

        tracing::debug!(key = %key, content_type = %content_type, path = ?full_path, "Stored object on local filesystem");
        Ok(())
    }
}

async fn write_object(path: &Path, source: &ByteSource) -> Result<()> {
    let mut reader = source.open().await.map_err(StoreError::Read)?;
    let mut file = fs::File::create(path).await?;

    tokio::io::copy(&mut reader, &mut file).await.map_err(StoreError::Read)?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.partial", uuid::Uuid::new_v4()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::keys::derive_key;
    use crate::types::RequestId;

    #[tokio::test]
    async fn test_local_store_writes_under_bucket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::create(temp_dir.path().to_path_buf(), "files").await.unwrap();

        let key = derive_key(&RequestId::from("abc123"), 0, "avatar").unwrap();
        store
            .put_object(&key, &ByteSource::from(b"png bytes".to_vec()), "image/png")
            .await
            .unwrap();

        let path = temp_dir.path().join("files").join("abc123").join("0_avatar");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png bytes");
        assert_eq!(store.object_path(&key), path);
    }

    #[tokio::test]
    async fn test_local_store_streams_file_sources() {
        let temp_dir = tempfile::tempdir().unwrap();
        let upload = temp_dir.path().join("incoming.pdf");
        tokio::fs::write(&upload, vec![7u8; 5 * 1024]).await.unwrap();

        let store = LocalObjectStore::create(temp_dir.path().join("objects"), "files").await.unwrap();
        let key = derive_key(&RequestId::from("abc123"), 1, "resume").unwrap();
        store.put_object(&key, &ByteSource::from(upload), "application/pdf").await.unwrap();

        let stored = tokio::fs::read(store.object_path(&key)).await.unwrap();
        assert_eq!(stored.len(), 5 * 1024);
    }

    #[tokio::test]
    async fn test_local_store_overwrites_same_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::create(temp_dir.path().to_path_buf(), "files").await.unwrap();
        let key = derive_key(&RequestId::from("again"), 0, "doc").unwrap();

        store.put_object(&key, &ByteSource::from(b"first".to_vec()), "text/plain").await.unwrap();
        store.put_object(&key, &ByteSource::from(b"second".to_vec()), "text/plain").await.unwrap();

        assert_eq!(tokio::fs::read(store.object_path(&key)).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_local_store_missing_source_leaves_no_object() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::create(temp_dir.path().to_path_buf(), "files").await.unwrap();
        let key = derive_key(&RequestId::from("broken"), 0, "doc").unwrap();

        let source = ByteSource::from(temp_dir.path().join("does-not-exist"));
        let result = store.put_object(&key, &source, "text/plain").await;

        assert!(matches!(result, Err(StoreError::Read(_))));
        assert!(!store.object_path(&key).exists());
    }
}
