use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, timeout::TimeoutConfig};
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
use aws_sdk_sqs::types::{MessageAttributeValue, QueueAttributeName};
use std::time::Duration;
use url::Url;

use super::{PublishReceipt, QueueError, QueuePublisher, Result};
use crate::pipeline::payload::Payload;

/// Message size limit assumed when the queue does not report its own
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

const REQUEST_ID_ATTRIBUTE: &str = "request_id";
const STRING_DATA_TYPE: &str = "String";

/// Connection settings for [`SqsPublisher::connect`]
#[derive(Debug, Clone)]
pub struct SqsSettings<'a> {
    pub region: &'a str,
    pub queue: &'a str,
    pub create_queue: bool,
    /// Custom endpoint, e.g. for LocalStack or ElasticMQ
    pub endpoint_url: Option<&'a Url>,
    pub operation_timeout: Duration,
}

/// Publishes payloads to an SQS queue as JSON message bodies.
///
/// Each message carries a `request_id` string attribute so consumers can route or filter without
/// decoding the body.
pub struct SqsPublisher {
    client: Client,
    queue_url: String,
    max_message_size: usize,
}

impl SqsPublisher {
    pub fn new(client: Client, queue_url: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            max_message_size,
        }
    }

    /// Resolve the queue URL by name (creating the queue if allowed) and read its size limit.
    pub async fn connect(settings: SqsSettings<'_>) -> Result<Self> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.to_string()))
            .timeout_config(TimeoutConfig::builder().operation_timeout(settings.operation_timeout).build())
            .load()
            .await;

        let mut builder = aws_sdk_sqs::config::Builder::from(&sdk_config);
        if let Some(endpoint) = settings.endpoint_url {
            builder = builder.endpoint_url(endpoint.as_str());
        }
        let client = Client::from_conf(builder.build());

        let queue_url = resolve_queue_url(&client, settings.queue, settings.create_queue).await?;
        let max_message_size = fetch_max_message_size(&client, &queue_url).await;

        tracing::info!(
            queue = %settings.queue,
            queue_url = %queue_url,
            max_message_size,
            "SQS publisher initialized"
        );

        Ok(Self::new(client, queue_url, max_message_size))
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

async fn resolve_queue_url(client: &Client, queue: &str, create: bool) -> Result<String> {
    match client.get_queue_url().queue_name(queue).send().await {
        Ok(output) => output.queue_url().map(str::to_string).ok_or_else(|| QueueError::Backend {
            message: format!("no URL returned for queue {}", queue),
            source: None,
        }),
        Err(SdkError::ServiceError(e)) if e.err().is_queue_does_not_exist() && create => {
            tracing::info!(queue = %queue, "Queue doesn't exist, creating it...");
            let output = client
                .create_queue()
                .queue_name(queue)
                .send()
                .await
                .map_err(|err| backend_error(format!("failed to create queue {}", queue), err))?;
            output.queue_url().map(str::to_string).ok_or_else(|| QueueError::Backend {
                message: format!("no URL returned for created queue {}", queue),
                source: None,
            })
        }
        Err(err) => Err(backend_error(format!("failed to resolve queue {}", queue), err)),
    }
}

/// Size SQS counts against the limit: the body plus every attribute's name, data type and value.
fn message_size(body: &str, payload: &Payload) -> usize {
    body.len() + REQUEST_ID_ATTRIBUTE.len() + STRING_DATA_TYPE.len() + payload.id.as_str().len()
}

async fn fetch_max_message_size(client: &Client, queue_url: &str) -> usize {
    let result = client
        .get_queue_attributes()
        .queue_url(queue_url)
        .attribute_names(QueueAttributeName::MaximumMessageSize)
        .send()
        .await;

    match result {
        Ok(output) => output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::MaximumMessageSize))
            .and_then(|size| size.parse().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
        Err(err) => {
            tracing::warn!(
                queue_url = %queue_url,
                error = %DisplayErrorContext(&err),
                "Failed to read queue attributes, assuming default message size limit"
            );
            DEFAULT_MAX_MESSAGE_SIZE
        }
    }
}

fn backend_error<E, R>(context: String, err: SdkError<E, R>) -> QueueError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    QueueError::Backend {
        message: format!("{}: {}", context, DisplayErrorContext(&err)),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl QueuePublisher for SqsPublisher {
    #[tracing::instrument(skip(self, payload), fields(request_id = %payload.id))]
    async fn publish(&self, payload: &Payload) -> Result<PublishReceipt> {
        let body = serde_json::to_string(payload)?;
        let size = message_size(&body, payload);
        if size > self.max_message_size {
            return Err(QueueError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }

        let request_id = MessageAttributeValue::builder()
            .data_type(STRING_DATA_TYPE)
            .string_value(payload.id.as_str())
            .build()
            .map_err(|e| QueueError::Backend {
                message: format!("failed to build message attribute: {}", e),
                source: Some(Box::new(e)),
            })?;

        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_attributes(REQUEST_ID_ATTRIBUTE, request_id)
            .send()
            .await
            .map_err(|err| match err {
                SdkError::ServiceError(service_err) => QueueError::Rejected {
                    message: DisplayErrorContext(service_err.err()).to_string(),
                },
                other => backend_error("failed to send message".to_string(), other),
            })?;

        let receipt = PublishReceipt {
            message_id: output.message_id().map(str::to_string),
        };
        tracing::debug!(message_id = ?receipt.message_id, "Message published");
        Ok(receipt)
    }
}
