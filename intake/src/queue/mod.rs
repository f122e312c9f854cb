//! Queue publisher.
//!
//! The pipeline hands each assembled [`Payload`] to a [`QueuePublisher`] exactly once, after all of
//! its files are stored. Backends:
//!
//! - [`sqs::SqsPublisher`]: Amazon SQS, the payload is sent as the JSON message body
//! - [`in_memory::InMemoryPublisher`]: records published payloads, used in tests

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, PublisherBackend};
use crate::pipeline::payload::Payload;

pub mod in_memory;
pub mod sqs;

pub use in_memory::InMemoryPublisher;
pub use sqs::SqsPublisher;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Payload could not be encoded as a message body
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encoded payload exceeds what the queue accepts
    #[error("message of {size} bytes exceeds the {limit} byte queue limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// The queue answered, but refused the message
    #[error("queue rejected message: {message}")]
    Rejected { message: String },

    /// The queue could not be reached or failed mid-request
    #[error("queue request failed: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Acknowledgement of a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Queue-assigned message id, when the backend provides one
    pub message_id: Option<String>,
}

/// Trait for queue backends
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publish one payload. Retries, if any, are the backend's business.
    async fn publish(&self, payload: &Payload) -> Result<PublishReceipt>;
}

/// Create the queue publisher selected in configuration
pub async fn create_publisher(config: &Config) -> anyhow::Result<Arc<dyn QueuePublisher>> {
    match &config.publisher {
        PublisherBackend::Sqs {
            create_queue,
            endpoint_url,
        } => {
            tracing::info!(region = %config.region, queue = %config.queue, "Creating SQS publisher");
            let publisher = SqsPublisher::connect(sqs::SqsSettings {
                region: &config.region,
                queue: &config.queue,
                create_queue: *create_queue,
                endpoint_url: endpoint_url.as_ref(),
                operation_timeout: config.operation_timeout,
            })
            .await?;
            Ok(Arc::new(publisher))
        }
        PublisherBackend::Memory => {
            tracing::warn!("Using in-memory queue publisher; messages are not delivered anywhere");
            Ok(Arc::new(InMemoryPublisher::new()))
        }
    }
}
