//! Amazon S3 object store.
//!
//! On startup the bucket is located: if it lives in a different region than configured, the client
//! is rebuilt against the bucket's real region; if it does not exist it is created (private ACL)
//! when `create_bucket` is enabled.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, timeout::TimeoutConfig};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketCannedAcl, BucketLocationConstraint, CreateBucketConfiguration};
use std::time::Duration;
use url::Url;

use super::{ByteSource, ObjectStore, Result, StoreDestination, StoreError, StoreLocation};
use crate::pipeline::keys::StorageKey;

/// Region S3 treats as the default; buckets there are created without a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Header S3 uses to report a bucket's region, including on redirect and error responses.
const BUCKET_REGION_HEADER: &str = "x-amz-bucket-region";

/// Connection settings for [`S3ObjectStore::connect`]
#[derive(Debug, Clone)]
pub struct S3Settings<'a> {
    pub region: &'a str,
    pub bucket: &'a str,
    pub create_bucket: bool,
    /// Custom endpoint, e.g. for MinIO or LocalStack
    pub endpoint_url: Option<&'a Url>,
    pub force_path_style: bool,
    pub operation_timeout: Duration,
}

enum BucketLookup {
    Found { region: Option<String> },
    Missing,
}

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Wrap an already configured client. The bucket must exist.
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the standard AWS config chain, then locate (or create) the bucket.
    pub async fn connect(settings: S3Settings<'_>) -> Result<Self> {
        let mut region = settings.region.to_string();
        let mut client = build_client(&settings, &region).await;

        match locate_bucket(&client, settings.bucket).await? {
            BucketLookup::Found { region: Some(actual) } if actual != region => {
                tracing::info!(
                    bucket = %settings.bucket,
                    configured_region = %region,
                    bucket_region = %actual,
                    "Bucket lives in another region, reconnecting"
                );
                region = actual;
                client = build_client(&settings, &region).await;
            }
            BucketLookup::Found { .. } => {
                tracing::debug!(bucket = %settings.bucket, region = %region, "Found existing bucket");
            }
            BucketLookup::Missing if settings.create_bucket => {
                create_bucket(&client, settings.bucket, &region).await?;
            }
            BucketLookup::Missing => {
                return Err(StoreError::Backend {
                    message: format!("bucket {} does not exist and create_bucket is disabled", settings.bucket),
                    source: None,
                });
            }
        }

        tracing::info!(bucket = %settings.bucket, region = %region, "S3 object store initialized");
        Ok(Self::new(client, settings.bucket))
    }
}

async fn build_client(settings: &S3Settings<'_>, region: &str) -> Client {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .timeout_config(TimeoutConfig::builder().operation_timeout(settings.operation_timeout).build())
        .load()
        .await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(settings.force_path_style);
    if let Some(endpoint) = settings.endpoint_url {
        builder = builder.endpoint_url(endpoint.as_str());
    }

    Client::from_conf(builder.build())
}

async fn locate_bucket(client: &Client, bucket: &str) -> Result<BucketLookup> {
    match client.head_bucket().bucket(bucket).send().await {
        Ok(output) => Ok(BucketLookup::Found {
            region: output.bucket_region().map(str::to_string),
        }),
        Err(err) => {
            if let SdkError::ServiceError(service_err) = &err
                && service_err.err().is_not_found()
            {
                return Ok(BucketLookup::Missing);
            }

            // A bucket in another region answers with a redirect that still names its region
            let redirect_region = err
                .raw_response()
                .and_then(|response| response.headers().get(BUCKET_REGION_HEADER))
                .map(str::to_string);
            if let Some(region) = redirect_region {
                return Ok(BucketLookup::Found { region: Some(region) });
            }

            Err(backend_error(format!("failed to look up bucket {}", bucket), err))
        }
    }
}

async fn create_bucket(client: &Client, bucket: &str, region: &str) -> Result<()> {
    tracing::info!(bucket = %bucket, region = %region, "Bucket doesn't exist, creating it...");

    let mut request = client.create_bucket().bucket(bucket).acl(BucketCannedAcl::Private);
    if region != DEFAULT_REGION {
        request = request.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build(),
        );
    }

    match request.send().await {
        Ok(_) => {
            tracing::info!(bucket = %bucket, "Created bucket");
            Ok(())
        }
        // Lost a creation race against another instance
        Err(SdkError::ServiceError(e)) if e.err().is_bucket_already_owned_by_you() => Ok(()),
        Err(err) => Err(backend_error(format!("failed to create bucket {}", bucket), err)),
    }
}

fn backend_error<E, R>(context: String, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    StoreError::Backend {
        message: format!("{}: {}", context, DisplayErrorContext(&err)),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn destination(&self) -> StoreDestination {
        StoreDestination {
            bucket: self.bucket.clone(),
            location: StoreLocation::S3,
        }
    }

    #[tracing::instrument(skip(self, source), fields(bucket = %self.bucket, key = %key))]
    async fn put_object(&self, key: &StorageKey, source: &ByteSource, content_type: &str) -> Result<()> {
        let body = match source {
            ByteSource::Memory(bytes) => ByteStream::from(bytes.clone()),
            ByteSource::File(path) => ByteStream::from_path(path)
                .await
                .map_err(|e| StoreError::Read(std::io::Error::other(e)))?,
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|err| match err {
                SdkError::ServiceError(service_err) => StoreError::Rejected {
                    key: key.to_string(),
                    message: DisplayErrorContext(service_err.err()).to_string(),
                },
                other => backend_error(format!("failed to upload {}", key), other),
            })?;

        tracing::debug!(content_type = %content_type, "Object stored");
        Ok(())
    }
}
