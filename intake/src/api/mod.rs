//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Response bodies that are not pipeline types themselves
//!
//! The only functional endpoint is `POST /requests`, which accepts a request with attached files,
//! stores the files and publishes a payload describing them. The OpenAPI document is served at
//! `/openapi.json` and rendered at `/docs`.

pub mod handlers;
pub mod models;
