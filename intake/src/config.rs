//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `INTAKE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **AWS_REGION** - Standard AWS variable, overrides `region` if set
//! 3. **Environment variables** - Variables prefixed with `INTAKE_` override everything above
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `INTAKE_STORAGE__TYPE=local` sets the `storage.type` field.
//!
//! ## Example
//!
//! ```yaml
//! region: eu-west-1
//! bucket: files
//! queue: requestQueue
//! storage:
//!   type: s3
//!   create_bucket: true
//! publisher:
//!   type: sqs
//! uploads:
//!   max_file_size: 104857600
//!   max_files: 32
//! ```
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! INTAKE_PORT=8080
//!
//! # Point both AWS clients at LocalStack
//! INTAKE_STORAGE__ENDPOINT_URL=http://localhost:4566
//! INTAKE_STORAGE__FORCE_PATH_STYLE=true
//! INTAKE_PUBLISHER__ENDPOINT_URL=http://localhost:4566
//! ```

use axum::http::HeaderName;
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "INTAKE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty file (or no file at all) yields a server that talks to
/// S3 and SQS in `us-east-1`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// AWS region of the bucket and queue. The bucket's real region wins if it differs.
    pub region: String,
    /// Bucket attached files are stored in (directory name for the local backend)
    pub bucket: String,
    /// Name of the queue payloads are published to
    pub queue: String,
    /// Object store backend
    pub storage: StorageBackend,
    /// Queue backend
    pub publisher: PublisherBackend,
    /// Limits applied to attached files
    pub uploads: UploadsConfig,
    /// Header carrying the caller-supplied request id
    pub request_id_header: String,
    /// Generate a request id when the header is missing; otherwise such requests are rejected
    pub generate_request_ids: bool,
    /// Per-operation timeout for object store and queue calls
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
    /// Expose Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Export traces over OTLP (configured through the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
}

/// Where attached files are written
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum StorageBackend {
    /// Amazon S3 or an S3-compatible service
    S3 {
        /// Create the bucket (private ACL) if it does not exist
        #[serde(default = "default_true")]
        create_bucket: bool,
        /// Custom endpoint, e.g. for MinIO or LocalStack
        #[serde(default)]
        endpoint_url: Option<Url>,
        /// Use path-style addressing (`endpoint/bucket/key`)
        #[serde(default)]
        force_path_style: bool,
    },
    /// Local directory; objects go to `<path>/<bucket>/<key>`
    Local { path: PathBuf },
    /// Process memory, lost on restart
    Memory,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::S3 {
            create_bucket: true,
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// Where payloads are published
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PublisherBackend {
    /// Amazon SQS or an SQS-compatible service
    Sqs {
        /// Create the queue if it does not exist
        #[serde(default)]
        create_queue: bool,
        /// Custom endpoint, e.g. for LocalStack or ElasticMQ
        #[serde(default)]
        endpoint_url: Option<Url>,
    },
    /// Keep published payloads in memory
    Memory,
}

impl Default for PublisherBackend {
    fn default() -> Self {
        PublisherBackend::Sqs {
            create_queue: false,
            endpoint_url: None,
        }
    }
}

/// Limits on attached files.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadsConfig {
    /// Maximum size of a single attached file in bytes (default: 100MB)
    pub max_file_size: u64,
    /// Maximum number of files attached to one request (default: 32)
    pub max_files: usize,
    /// Maximum simultaneous uploads per request. Unset uploads every file at once.
    pub max_concurrency: Option<usize>,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_files: 32,
            max_concurrency: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            region: "us-east-1".to_string(),
            bucket: "files".to_string(),
            queue: "requests".to_string(),
            storage: StorageBackend::default(),
            publisher: PublisherBackend::default(),
            uploads: UploadsConfig::default(),
            request_id_header: "x-request-id".to_string(),
            generate_request_ids: true,
            operation_timeout: Duration::from_secs(30),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.bucket.trim().is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: bucket must not be empty".to_string(),
            });
        }

        let uses_aws = matches!(self.storage, StorageBackend::S3 { .. }) || matches!(self.publisher, PublisherBackend::Sqs { .. });
        if uses_aws && self.region.trim().is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: region must be set when using S3 or SQS. \
                     Set INTAKE_REGION or AWS_REGION, or add region to the config file."
                    .to_string(),
            });
        }

        if matches!(self.publisher, PublisherBackend::Sqs { .. }) && self.queue.trim().is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: queue must not be empty when publishing to SQS".to_string(),
            });
        }

        if let StorageBackend::Local { path } = &self.storage
            && path.as_os_str().is_empty()
        {
            return Err(Error::Internal {
                operation: "Config validation: storage.path must not be empty for the local backend".to_string(),
            });
        }

        if self.uploads.max_file_size == 0 {
            return Err(Error::Internal {
                operation: "Config validation: uploads.max_file_size must be greater than 0".to_string(),
            });
        }

        if self.uploads.max_files == 0 {
            return Err(Error::Internal {
                operation: "Config validation: uploads.max_files must be greater than 0".to_string(),
            });
        }

        if self.uploads.max_concurrency == Some(0) {
            return Err(Error::Internal {
                operation: "Config validation: uploads.max_concurrency must be greater than 0 when set".to_string(),
            });
        }

        if HeaderName::from_bytes(self.request_id_header.as_bytes()).is_err() {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: request_id_header ({:?}) is not a valid HTTP header name",
                    self.request_id_header
                ),
            });
        }

        if self.operation_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: operation_timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // The standard AWS region variable, if present
            .merge(Env::raw().only(&["AWS_REGION"]).map(|_| "region".into()))
            // Environment variables can still override specific values. INTAKE_CONFIG names the file
            // itself and is read by clap.
            .merge(Env::prefixed("INTAKE_").ignore(&["CONFIG"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
