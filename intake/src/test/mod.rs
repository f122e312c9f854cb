//! HTTP-level tests against in-memory backends.

use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::{Config, PublisherBackend, StorageBackend};
use crate::pipeline::RequestHandler;
use crate::queue::InMemoryPublisher;
use crate::storage::InMemoryObjectStore;
use crate::{AppState, Application};

struct TestApp {
    server: axum_test::TestServer,
    store: InMemoryObjectStore,
    publisher: InMemoryPublisher,
}

fn create_test_config() -> Config {
    Config {
        bucket: "files".to_string(),
        queue: "requestQueue".to_string(),
        storage: StorageBackend::Memory,
        publisher: PublisherBackend::Memory,
        ..Default::default()
    }
}

fn create_test_app(config: Config) -> TestApp {
    let store = InMemoryObjectStore::new(config.bucket.clone());
    let publisher = InMemoryPublisher::new();
    let handler = RequestHandler::new(Arc::new(store.clone()), Arc::new(publisher.clone()))
        .with_max_concurrency(config.uploads.max_concurrency);

    TestApp {
        server: Application::with_handler(config, handler).into_test_server(),
        store,
        publisher,
    }
}

fn avatar() -> Part {
    Part::bytes(vec![0xAB; 1024]).file_name("avatar.png").mime_type("image/png")
}

fn resume() -> Part {
    Part::bytes(vec![0xCD; 5 * 1024]).file_name("resume.pdf")
}

#[test_log::test(tokio::test)]
async fn test_submit_multipart_request() {
    let app = create_test_app(create_test_config());

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "abc123")
        .multipart(
            MultipartForm::new()
                .add_text("name", "Jane")
                .add_text("role", "engineer")
                .add_part("avatar", avatar())
                .add_part("resume", resume()),
        )
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    assert_eq!(response.header("x-request-id"), "abc123");

    let payload: Value = response.json();
    assert_eq!(
        payload,
        json!({
            "id": "abc123",
            "body": {"name": "Jane", "role": "engineer"},
            "files": [
                {"index": 0, "name": "avatar", "key": "abc123/0_avatar"},
                {"index": 1, "name": "resume", "key": "abc123/1_resume"}
            ],
            "bucket": "files",
            "location": "memory"
        })
    );

    assert_eq!(app.store.get("abc123/0_avatar").unwrap().content_type, "image/png");
    // No part content type, guessed from the file name
    assert_eq!(app.store.get("abc123/1_resume").unwrap().content_type, "application/pdf");
    assert_eq!(app.store.get("abc123/1_resume").unwrap().content.len(), 5 * 1024);

    let published = app.publisher.messages();
    assert_eq!(published.len(), 1);
    assert_eq!(serde_json::to_value(&published[0]).unwrap(), payload);
}

#[tokio::test]
async fn test_submit_json_request_without_files() {
    let app = create_test_app(create_test_config());

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "json-only")
        .json(&json!({"ping": true, "items": [1, 2, 3]}))
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let payload: Value = response.json();
    assert_eq!(payload["body"], json!({"ping": true, "items": [1, 2, 3]}));
    assert_eq!(payload["files"], json!([]));
    assert_eq!(app.store.write_attempts(), 0);
    assert_eq!(app.publisher.message_count(), 1);
}

#[tokio::test]
async fn test_body_part_replaces_body() {
    let app = create_test_app(create_test_config());

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "structured")
        .multipart(
            MultipartForm::new()
                .add_text("body", r#"{"applicant": {"name": "Jane"}, "tags": ["a", "b"]}"#)
                .add_part("avatar", avatar()),
        )
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let payload: Value = response.json();
    assert_eq!(payload["body"], json!({"applicant": {"name": "Jane"}, "tags": ["a", "b"]}));
    assert_eq!(payload["files"][0]["key"], "structured/0_avatar");
}

#[tokio::test]
async fn test_body_part_must_be_json() {
    let app = create_test_app(create_test_config());

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "bad-body")
        .multipart(MultipartForm::new().add_text("body", "not json"))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(app.publisher.attempts(), 0);
}

#[tokio::test]
async fn test_generated_request_id_is_echoed() {
    let app = create_test_app(create_test_config());

    let response = app
        .server
        .post("/requests")
        .multipart(MultipartForm::new().add_part("avatar", avatar()))
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let payload: Value = response.json();
    let id = payload["id"].as_str().unwrap().to_string();
    assert_eq!(response.header("x-request-id"), id.as_str());
    assert_eq!(payload["files"][0]["key"], format!("{id}/0_avatar"));
    assert!(app.store.contains(&format!("{id}/0_avatar")));
}

#[tokio::test]
async fn test_missing_request_id_rejected_when_generation_disabled() {
    let config = Config {
        generate_request_ids: false,
        ..create_test_config()
    };
    let app = create_test_app(config);

    let response = app
        .server
        .post("/requests")
        .multipart(MultipartForm::new().add_part("avatar", avatar()))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(app.store.write_attempts(), 0);
}

#[tokio::test]
async fn test_custom_request_id_header() {
    let config = Config {
        request_id_header: "x-correlation-id".to_string(),
        ..create_test_config()
    };
    let app = create_test_app(config);

    let response = app
        .server
        .post("/requests")
        .add_header("x-correlation-id", "corr-1")
        .multipart(MultipartForm::new().add_part("avatar", avatar()))
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    assert_eq!(response.header("x-correlation-id"), "corr-1");
    assert!(app.store.contains("corr-1/0_avatar"));
}

#[tokio::test]
async fn test_invalid_request_id_is_bad_request() {
    let app = create_test_app(create_test_config());

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "../escape")
        .multipart(MultipartForm::new().add_part("avatar", avatar()))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(app.store.write_attempts(), 0);
    assert_eq!(app.publisher.attempts(), 0);
}

#[tokio::test]
async fn test_upload_failure_returns_bad_gateway_and_publishes_nothing() {
    let app = create_test_app(create_test_config());
    app.store.fail_key("abc123/1_resume", "network error");

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "abc123")
        .multipart(
            MultipartForm::new()
                .add_part("avatar", avatar())
                .add_part("resume", resume()),
        )
        .await;

    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert_eq!(body["error"], "upload_failed");
    assert_eq!(body["failures"].as_array().unwrap().len(), 1);
    assert_eq!(body["failures"][0]["name"], "resume");
    assert_eq!(body["orphaned_keys"], json!(["abc123/0_avatar"]));
    assert_eq!(app.publisher.attempts(), 0);
}

#[tokio::test]
async fn test_publish_failure_returns_orphaned_keys() {
    let app = create_test_app(create_test_config());
    app.publisher.fail_next("queue unavailable");

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "abc123")
        .multipart(
            MultipartForm::new()
                .add_part("avatar", avatar())
                .add_part("resume", resume()),
        )
        .await;

    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert_eq!(body["error"], "publish_failed");
    assert_eq!(body["orphaned_keys"], json!(["abc123/0_avatar", "abc123/1_resume"]));
    assert!(app.store.contains("abc123/0_avatar"));
    assert!(app.store.contains("abc123/1_resume"));

    // Resubmitting overwrites the same keys and publishes once
    let retry = app
        .server
        .post("/requests")
        .add_header("x-request-id", "abc123")
        .multipart(
            MultipartForm::new()
                .add_part("avatar", avatar())
                .add_part("resume", resume()),
        )
        .await;

    retry.assert_status(StatusCode::ACCEPTED);
    assert_eq!(app.store.len(), 2);
    assert_eq!(app.publisher.message_count(), 1);
}

#[tokio::test]
async fn test_too_many_files() {
    let mut config = create_test_config();
    config.uploads.max_files = 1;
    let app = create_test_app(config);

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "crowded")
        .multipart(
            MultipartForm::new()
                .add_part("avatar", avatar())
                .add_part("resume", resume()),
        )
        .await;

    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(app.store.write_attempts(), 0);
}

#[tokio::test]
async fn test_file_too_large() {
    let mut config = create_test_config();
    config.uploads.max_file_size = 2048;
    let app = create_test_app(config);

    let response = app
        .server
        .post("/requests")
        .add_header("x-request-id", "heavy")
        .multipart(
            MultipartForm::new()
                .add_part("avatar", avatar())
                .add_part("resume", resume()),
        )
        .await;

    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(app.store.write_attempts(), 0);
    assert_eq!(app.publisher.attempts(), 0);
}

#[tokio::test]
async fn test_unsupported_content_type() {
    let app = create_test_app(create_test_config());

    let response = app.server.post("/requests").text("hello").await;

    response.assert_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_healthz() {
    let app = create_test_app(create_test_config());

    let response = app.server.get("/healthz").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "OK");
}

#[tokio::test]
async fn test_openapi_endpoints() {
    let app = create_test_app(create_test_config());

    let document = app.server.get("/openapi.json").await;
    document.assert_status_ok();
    let content = document.text();
    assert!(content.contains("\"openapi\""));
    assert!(content.contains("/requests"));

    let docs = app.server.get("/docs").await;
    docs.assert_status_ok();
}

#[tokio::test]
async fn test_metrics_route_absent_when_disabled() {
    let app = create_test_app(create_test_config());

    let response = app.server.get("/internal/metrics").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_route_when_enabled() {
    let config = Config {
        enable_metrics: true,
        ..create_test_config()
    };
    let store = InMemoryObjectStore::new("files");
    let publisher = InMemoryPublisher::new();
    let state = AppState::builder()
        .handler(RequestHandler::new(Arc::new(store), Arc::new(publisher)))
        .config(config)
        .build();
    let server = axum_test::TestServer::new(crate::build_router(state)).expect("Failed to create test server");

    server
        .post("/requests")
        .add_header("x-request-id", "metered")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let response = server.get("/internal/metrics").await;
    response.assert_status_ok();
    let content = response.text();
    assert!(content.contains("# TYPE"));
    assert!(content.contains("intake_requests_total"));
}
