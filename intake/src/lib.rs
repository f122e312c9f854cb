//! # intake: request intake adapter
//!
//! `intake` accepts a request carrying a JSON body and any number of attached files, stores every
//! file in an object store (S3 in production) and then publishes a single message to a queue (SQS in
//! production) that carries the body plus the storage key of each file. Downstream workers consume
//! the queue and fetch the files by key.
//!
//! ## Request Flow
//!
//! 1. `POST /requests` ([`api::handlers::requests::submit_request`]) parses the multipart (or
//!    JSON) body into an [`IntakeRequest`](pipeline::IntakeRequest) and a list of
//!    [`AttachedFile`](pipeline::AttachedFile)s.
//! 2. [`RequestHandler::handle`](pipeline::RequestHandler::handle) derives a deterministic key for
//!    every file (`<request-id>/<ordinal>_<field-name>`), uploads all files concurrently, and waits
//!    for every upload to finish.
//! 3. Only if all uploads succeeded is the payload published. A message on the queue therefore
//!    never references an object that does not exist.
//!
//! Upload and publish failures are reported separately (HTTP 502 with `upload_failed` or
//! `publish_failed`), since after a publish failure the stored files are orphaned until the caller
//! resubmits with the same request id.
//!
//! ## Backends
//!
//! Both sides sit behind traits ([`storage::ObjectStore`], [`queue::QueuePublisher`]) selected at
//! startup from [`config::Config`]: S3, a local directory, or memory for storage, and SQS or memory
//! for the queue.

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub mod api;
pub mod config;
pub mod errors;
pub mod openapi;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test;

pub use config::Config;
use openapi::ApiDoc;
use pipeline::RequestHandler;

/// Headroom for multipart framing and text fields on top of the file limits
const BODY_LIMIT_OVERHEAD: usize = 1024 * 1024;

/// Shared state handed to every route
#[derive(Clone, Builder)]
pub struct AppState {
    pub handler: RequestHandler,
    pub config: Config,
}

/// Largest request body the router accepts: every allowed file at its maximum size, plus overhead.
fn body_limit(config: &Config) -> usize {
    let max_file_size = usize::try_from(config.uploads.max_file_size).unwrap_or(usize::MAX);
    max_file_size
        .saturating_mul(config.uploads.max_files)
        .saturating_add(BODY_LIMIT_OVERHEAD)
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    let enable_metrics = state.config.enable_metrics;
    let limit = body_limit(&state.config);

    let mut router = Router::new()
        .route("/requests", post(api::handlers::requests::submit_request))
        .layer(DefaultBodyLimit::max(limit))
        .route("/healthz", get(|| async { "OK" }))
        .route("/openapi.json", get(|| async { axum::Json(ApiDoc::openapi()) }))
        .with_state(state)
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    if enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// The running service: object store and publisher connected, router built.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] connects the backends named in the config (creating the
///    bucket or queue if configured to) and builds the router
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests
/// 3. **Shutdown**: when the shutdown future resolves, in-flight requests finish and telemetry is
///    flushed
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting intake with configuration: {:#?}", config);

        let store = storage::create_object_store(&config).await?;
        let publisher = queue::create_publisher(&config).await?;
        let handler = RequestHandler::new(store, publisher).with_max_concurrency(config.uploads.max_concurrency);

        Ok(Self::with_handler(config, handler))
    }

    /// Build around an existing handler, e.g. one with pre-built backends
    pub fn with_handler(config: Config, handler: RequestHandler) -> Self {
        let state = AppState::builder().handler(handler).config(config.clone()).build();
        Self {
            router: build_router(state),
            config,
        }
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("intake listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
