//! OpenAPI documentation, served as JSON at `/openapi.json` and rendered with Scalar at `/docs`.

use utoipa::OpenApi;

use crate::api;
use crate::api::models::requests::{FailedFile, IntakeErrorResponse};
use crate::pipeline::{FileDescriptor, Payload};
use crate::storage::StoreLocation;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "intake",
        description = "Stores files attached to a request in an object store, then publishes one queue message describing the request and where its files are."
    ),
    paths(api::handlers::requests::submit_request),
    components(schemas(Payload, FileDescriptor, StoreLocation, IntakeErrorResponse, FailedFile)),
    tags(
        (name = "requests", description = "Request submission"),
    )
)]
pub struct ApiDoc;
