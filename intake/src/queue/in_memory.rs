use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{PublishReceipt, QueueError, QueuePublisher, Result};
use crate::pipeline::payload::Payload;

/// In-memory publisher that records every published payload.
///
/// Failures can be queued up with [`fail_next`](Self::fail_next); they are consumed in FIFO order,
/// one per publish call.
#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    messages: Arc<Mutex<Vec<Payload>>>,
    failures: Arc<Mutex<VecDeque<String>>>,
    attempts: Arc<AtomicUsize>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next publish call fail with a rejection carrying `message`
    pub fn fail_next(&self, message: impl Into<String>) {
        self.failures.lock().push_back(message.into());
    }

    /// All successfully published payloads, in publish order
    pub fn messages(&self) -> Vec<Payload> {
        self.messages.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Number of publish calls, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueuePublisher for InMemoryPublisher {
    async fn publish(&self, payload: &Payload) -> Result<PublishReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.failures.lock().pop_front() {
            return Err(QueueError::Rejected { message });
        }

        let mut messages = self.messages.lock();
        messages.push(payload.clone());
        Ok(PublishReceipt {
            message_id: Some(format!("memory-{}", messages.len())),
        })
    }
}
