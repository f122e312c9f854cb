//! In-memory object store.
//!
//! Objects live in a concurrent map and are lost on restart. Besides backing the `memory` storage
//! backend, the store can be told to fail writes for specific keys and to delay every write, which
//! lets tests exercise partial-failure and ordering behaviour of the pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ByteSource, ObjectStore, Result, StoreDestination, StoreError, StoreLocation};
use crate::pipeline::keys::StorageKey;

/// An object held by [`InMemoryObjectStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content: Bytes,
    pub content_type: String,
}

#[derive(Clone)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: Arc<DashMap<String, StoredObject>>,
    failures: Arc<DashMap<String, String>>,
    write_attempts: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::new(DashMap::new()),
            failures: Arc::new(DashMap::new()),
            write_attempts: Arc::new(AtomicUsize::new(0)),
            latency: None,
        }
    }

    /// Delay every write by `latency` before it is acknowledged
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every write to `key` fail with a backend error carrying `message`
    pub fn fail_key(&self, key: impl Into<String>, message: impl Into<String>) {
        self.failures.insert(key.into(), message.into());
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Number of objects currently stored
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of writes attempted, successful or not
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn destination(&self) -> StoreDestination {
        StoreDestination {
            bucket: self.bucket.clone(),
            location: StoreLocation::Memory,
        }
    }

    async fn put_object(&self, key: &StorageKey, source: &ByteSource, content_type: &str) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = self.failures.get(key.as_str()) {
            return Err(StoreError::Backend {
                message: message.value().clone(),
                source: None,
            });
        }

        let content = source.read_all().await.map_err(StoreError::Read)?;
        self.objects.insert(
            key.to_string(),
            StoredObject {
                content,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}
