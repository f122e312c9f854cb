use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::errors::IntakeError;
use super::payload::Payload;
use super::uploads::{AttachedFile, upload_all};
use crate::queue::QueuePublisher;
use crate::storage::ObjectStore;
use crate::types::RequestId;

/// An inbound request, minus its files
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub id: RequestId,
    /// Opaque body, forwarded verbatim in the payload
    pub body: serde_json::Value,
}

impl IntakeRequest {
    pub fn new(id: impl Into<RequestId>, body: serde_json::Value) -> Self {
        Self { id: id.into(), body }
    }
}

/// Lifecycle of one request through [`RequestHandler::handle`].
///
/// `Received -> Assembling -> Uploading -> {Failed | Publishing} -> {Failed | Completed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeStage {
    Received,
    Assembling,
    Uploading,
    Publishing,
    Completed,
    Failed,
}

impl IntakeStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntakeStage::Completed | IntakeStage::Failed)
    }
}

impl fmt::Display for IntakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntakeStage::Received => "received",
            IntakeStage::Assembling => "assembling",
            IntakeStage::Uploading => "uploading",
            IntakeStage::Publishing => "publishing",
            IntakeStage::Completed => "completed",
            IntakeStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct StageTracker {
    stage: IntakeStage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            stage: IntakeStage::Received,
        }
    }

    fn enter(&mut self, next: IntakeStage) {
        debug_assert!(!self.stage.is_terminal(), "no transitions out of a terminal stage");
        tracing::debug!(from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
    }

    fn fail(&mut self, err: IntakeError) -> IntakeError {
        tracing::warn!(stage = %self.stage, kind = err.kind(), error = %err, "Intake failed");
        self.stage = IntakeStage::Failed;
        err
    }
}

/// Entry point of the pipeline: stores a request's files, then publishes one payload describing
/// them.
///
/// The store and publisher are injected once and shared by every request; the handler itself
/// holds no per-request state and is cheap to clone.
#[derive(Clone)]
pub struct RequestHandler {
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn QueuePublisher>,
    max_concurrency: Option<usize>,
}

impl RequestHandler {
    pub fn new(store: Arc<dyn ObjectStore>, publisher: Arc<dyn QueuePublisher>) -> Self {
        Self {
            store,
            publisher,
            max_concurrency: None,
        }
    }

    /// Cap the number of simultaneous uploads per request (`None` = no cap)
    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Run one request through the pipeline.
    ///
    /// The payload is published only after every file is acknowledged by the store, and at most
    /// once. On [`IntakeError::Upload`] the queue is never touched; on [`IntakeError::Publish`] the
    /// files are stored but unreferenced. Nothing is retried or rolled back here.
    #[tracing::instrument(skip_all, fields(request_id = %request.id, files = files.len()))]
    pub async fn handle(&self, request: IntakeRequest, files: Vec<AttachedFile>) -> Result<Payload, IntakeError> {
        let started = Instant::now();
        let result = self.run(request, &files).await;

        let outcome = match &result {
            Ok(_) => "completed",
            Err(e) => e.kind(),
        };
        metrics::counter!("intake_requests_total", "outcome" => outcome).increment(1);
        metrics::histogram!("intake_request_duration_seconds", "outcome" => outcome).record(started.elapsed().as_secs_f64());

        result
    }

    async fn run(&self, request: IntakeRequest, files: &[AttachedFile]) -> Result<Payload, IntakeError> {
        let mut tracker = StageTracker::new();

        tracker.enter(IntakeStage::Assembling);
        let payload = Payload::assemble(&request.id, request.body, files, self.store.destination())
            .map_err(|e| tracker.fail(e.into()))?;

        tracker.enter(IntakeStage::Uploading);
        let stored = upload_all(self.store.as_ref(), &payload.id, files, self.max_concurrency)
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.enter(IntakeStage::Publishing);
        match self.publisher.publish(&payload).await {
            Ok(receipt) => {
                tracker.enter(IntakeStage::Completed);
                tracing::info!(
                    message_id = ?receipt.message_id,
                    files = payload.files.len(),
                    "Request accepted and published"
                );
                Ok(payload)
            }
            Err(source) => {
                tracing::error!(
                    orphaned_keys = ?stored.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
                    error = %source,
                    "Files stored but publish failed; objects are unreferenced until resubmission"
                );
                Err(tracker.fail(IntakeError::Publish {
                    request_id: payload.id,
                    stored,
                    source,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryPublisher, PublishReceipt, QueueError};
    use crate::storage::{InMemoryObjectStore, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn handler(store: &InMemoryObjectStore, publisher: &InMemoryPublisher) -> RequestHandler {
        RequestHandler::new(Arc::new(store.clone()), Arc::new(publisher.clone()))
    }

    fn scenario_files() -> Vec<AttachedFile> {
        vec![
            AttachedFile::new("avatar", "image/png", vec![0xAB; 1024]),
            AttachedFile::new("resume", "application/pdf", vec![0xCD; 5 * 1024]),
        ]
    }

    #[test_log::test(tokio::test)]
    async fn test_two_file_scenario() {
        let store = InMemoryObjectStore::new("files");
        let publisher = InMemoryPublisher::new();
        let body = json!({"name": "Jane", "role": "engineer"});

        let payload = handler(&store, &publisher)
            .handle(IntakeRequest::new("abc123", body.clone()), scenario_files())
            .await
            .unwrap();

        assert_eq!(payload.body, body);
        assert_eq!(
            serde_json::to_value(&payload.files).unwrap(),
            json!([
                {"index": 0, "name": "avatar", "key": "abc123/0_avatar"},
                {"index": 1, "name": "resume", "key": "abc123/1_resume"}
            ])
        );

        let avatar = store.get("abc123/0_avatar").unwrap();
        assert_eq!(avatar.content.len(), 1024);
        assert_eq!(avatar.content_type, "image/png");
        let resume = store.get("abc123/1_resume").unwrap();
        assert_eq!(resume.content.len(), 5 * 1024);
        assert_eq!(resume.content_type, "application/pdf");

        assert_eq!(publisher.messages(), vec![payload]);
    }

    #[tokio::test]
    async fn test_failed_upload_publishes_nothing() {
        let store = InMemoryObjectStore::new("files");
        store.fail_key("abc123/1_resume", "network error");
        let publisher = InMemoryPublisher::new();

        let result = handler(&store, &publisher)
            .handle(IntakeRequest::new("abc123", json!({})), scenario_files())
            .await;

        match result {
            Err(IntakeError::Upload(err)) => {
                assert_eq!(err.failures.len(), 1);
                assert_eq!(err.failures[0].name, "resume");
                assert!(matches!(err.failures[0].source, StoreError::Backend { .. }));
            }
            other => panic!("expected upload error, got {:?}", other),
        }
        assert_eq!(publisher.attempts(), 0);
    }

    #[tokio::test]
    async fn test_empty_file_list() {
        let store = InMemoryObjectStore::new("files");
        let publisher = InMemoryPublisher::new();

        let payload = handler(&store, &publisher)
            .handle(IntakeRequest::new("no-files", json!({"ping": true})), vec![])
            .await
            .unwrap();

        assert!(payload.files.is_empty());
        assert_eq!(store.write_attempts(), 0);
        assert_eq!(publisher.message_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_distinct_and_keeps_files() {
        let store = InMemoryObjectStore::new("files");
        let publisher = InMemoryPublisher::new();
        publisher.fail_next("queue unavailable");

        let result = handler(&store, &publisher)
            .handle(IntakeRequest::new("abc123", json!({})), scenario_files())
            .await;

        match result {
            Err(IntakeError::Publish { request_id, stored, source }) => {
                assert_eq!(request_id.as_str(), "abc123");
                let stored: Vec<_> = stored.iter().map(|k| k.as_str()).collect();
                assert_eq!(stored, vec!["abc123/0_avatar", "abc123/1_resume"]);
                assert!(matches!(source, QueueError::Rejected { .. }));
            }
            other => panic!("expected publish error, got {:?}", other),
        }
        assert!(store.contains("abc123/0_avatar"));
        assert!(store.contains("abc123/1_resume"));
        assert_eq!(publisher.attempts(), 1);
        assert_eq!(publisher.message_count(), 0);
    }

    #[tokio::test]
    async fn test_resubmission_reuses_keys() {
        let store = InMemoryObjectStore::new("files");
        let publisher = InMemoryPublisher::new();
        let handler = handler(&store, &publisher);

        let first = handler
            .handle(IntakeRequest::new("retry-me", json!({})), scenario_files())
            .await
            .unwrap();
        let second = handler
            .handle(IntakeRequest::new("retry-me", json!({})), scenario_files())
            .await
            .unwrap();

        assert_eq!(first.files, second.files);
        assert_eq!(store.len(), 2);
        assert_eq!(publisher.message_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_id_touches_nothing() {
        let store = InMemoryObjectStore::new("files");
        let publisher = InMemoryPublisher::new();

        let result = handler(&store, &publisher)
            .handle(IntakeRequest::new("bad/id", json!({})), scenario_files())
            .await;

        assert!(matches!(result, Err(IntakeError::KeyDerivation(_))));
        assert_eq!(store.write_attempts(), 0);
        assert_eq!(publisher.attempts(), 0);
    }

    #[tokio::test]
    async fn test_many_files_keep_input_order() {
        let store = InMemoryObjectStore::new("files");
        let publisher = InMemoryPublisher::new();
        let files: Vec<_> = (0..20)
            .map(|i| AttachedFile::new(if i % 2 == 0 { "even" } else { "odd" }, "text/plain", format!("file {i}").into_bytes()))
            .collect();

        let payload = handler(&store, &publisher)
            .with_max_concurrency(Some(4))
            .handle(IntakeRequest::new("bulk", json!(null)), files)
            .await
            .unwrap();

        assert_eq!(payload.files.len(), 20);
        for (i, descriptor) in payload.files.iter().enumerate() {
            assert_eq!(descriptor.index, i);
            assert_eq!(descriptor.key.as_str(), format!("bulk/{}_{}", i, descriptor.name));
        }
        assert_eq!(store.len(), 20);
    }

    /// Publisher that checks every referenced object is already stored when it is called
    struct VerifyingPublisher {
        store: InMemoryObjectStore,
        inner: InMemoryPublisher,
    }

    #[async_trait]
    impl QueuePublisher for VerifyingPublisher {
        async fn publish(&self, payload: &Payload) -> crate::queue::Result<PublishReceipt> {
            for key in payload.keys() {
                assert!(self.store.contains(key.as_str()), "published before {} was stored", key);
            }
            self.inner.publish(payload).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_happens_after_all_uploads() {
        let store = InMemoryObjectStore::new("files").with_latency(Duration::from_millis(50));
        let inner = InMemoryPublisher::new();
        let publisher = VerifyingPublisher {
            store: store.clone(),
            inner: inner.clone(),
        };
        let handler = RequestHandler::new(Arc::new(store.clone()), Arc::new(publisher));

        let files: Vec<_> = (0..8).map(|i| AttachedFile::new(format!("f{i}"), "text/plain", vec![i as u8])).collect();
        handler.handle(IntakeRequest::new("ordered", json!({})), files).await.unwrap();

        assert_eq!(inner.message_count(), 1);
    }

    #[test]
    fn test_terminal_stages() {
        assert!(IntakeStage::Completed.is_terminal());
        assert!(IntakeStage::Failed.is_terminal());
        assert!(!IntakeStage::Publishing.is_terminal());
        assert_eq!(IntakeStage::Uploading.to_string(), "uploading");
    }

    #[tokio::test]
    async fn test_handle_runs_on_a_spawned_task() {
        let store = InMemoryObjectStore::new("files");
        let publisher = InMemoryPublisher::new();
        let handler = handler(&store, &publisher).with_max_concurrency(Some(2));

        let payload = tokio::spawn(async move {
            handler
                .handle(IntakeRequest::new("spawned", json!({})), scenario_files())
                .await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(payload.files.len(), 2);
        assert_eq!(publisher.message_count(), 1);
    }
}
