use axum::{
    Json,
    extract::{FromRequest, Multipart, Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::CONTENT_TYPE,
    },
};
use bytes::BytesMut;
use serde_json::{Map, Value};

use crate::AppState;
use crate::api::models::requests::IntakeErrorResponse;
use crate::config::UploadsConfig;
use crate::errors::{Error, Result};
use crate::pipeline::{AttachedFile, IntakeRequest, Payload};
use crate::types::RequestId;

/// Name of the multipart text part whose JSON content replaces the whole body
const BODY_PART: &str = "body";

/// Submit a request with attached files.
#[utoipa::path(
    post,
    path = "/requests",
    tag = "requests",
    summary = "Submit request",
    description = "Store every attached file, then publish one message describing the request.

Send `multipart/form-data`: parts with a filename are attached files, numbered in the order they \
arrive. Other parts become fields of the JSON body; a repeated field becomes an array, and a part \
named `body` holding a JSON document replaces the body entirely. An `application/json` request is \
forwarded as the body with no files.

The message is published only after all files are stored. Resubmitting with the same request id \
overwrites the same keys.",
    request_body(
        content_type = "multipart/form-data",
        description = "Attached files and body fields"
    ),
    params(
        ("x-request-id" = Option<String>, Header, description = "Caller-supplied request id. Generated when absent, if the server allows it.")
    ),
    responses(
        (status = 202, description = "Files stored and message published", body = Payload),
        (status = 400, description = "Malformed request or invalid request id / field name"),
        (status = 413, description = "Too many files, or a file is too large"),
        (status = 415, description = "Body is neither multipart nor JSON"),
        (status = 502, description = "A file could not be stored, or the message could not be published", body = IntakeErrorResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn submit_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<(StatusCode, [(HeaderName, HeaderValue); 1], Json<Payload>)> {
    let header_name = HeaderName::from_bytes(state.config.request_id_header.as_bytes()).map_err(|e| Error::Internal {
        operation: format!("parse request id header name: {e}"),
    })?;
    let request_id = request_id_from_headers(&headers, &header_name, state.config.generate_request_ids)?;

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (body, files) = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state).await.map_err(|e| Error::BadRequest {
            message: format!("Invalid multipart request: {}", e.body_text()),
        })?;
        read_multipart(multipart, &state.config.uploads).await?
    } else if is_json(&content_type) {
        let Json(body) = Json::<Value>::from_request(request, &state).await.map_err(|e| Error::BadRequest {
            message: e.body_text(),
        })?;
        (body, Vec::new())
    } else {
        return Err(Error::UnsupportedMediaType { content_type });
    };

    tracing::debug!(request_id = %request_id, files = files.len(), "Request parsed");

    let payload = state.handler.handle(IntakeRequest::new(request_id, body), files).await?;

    let echoed = HeaderValue::from_str(payload.id.as_str()).map_err(|e| Error::Internal {
        operation: format!("encode request id header: {e}"),
    })?;
    Ok((StatusCode::ACCEPTED, [(header_name, echoed)], Json(payload)))
}

fn is_json(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence == "application/json" || essence.ends_with("+json")
}

fn request_id_from_headers(headers: &HeaderMap, name: &HeaderName, generate: bool) -> Result<RequestId> {
    match headers.get(name) {
        Some(value) => {
            let id = value.to_str().map_err(|_| Error::BadRequest {
                message: format!("Header '{name}' must be visible ASCII"),
            })?;
            let id = id.trim();
            if id.is_empty() {
                return Err(Error::BadRequest {
                    message: format!("Header '{name}' must not be empty"),
                });
            }
            Ok(RequestId::new(id))
        }
        None if generate => Ok(RequestId::generate()),
        None => Err(Error::BadRequest {
            message: format!("Missing required header '{name}'"),
        }),
    }
}

/// Split a multipart body into attached files (in arrival order) and a JSON body.
async fn read_multipart(mut multipart: Multipart, limits: &UploadsConfig) -> Result<(Value, Vec<AttachedFile>)> {
    let mut fields = Map::new();
    let mut explicit_body: Option<Value> = None;
    let mut files = Vec::new();

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(Error::BadRequest {
                message: "Every multipart part needs a name".to_string(),
            });
        }

        let Some(file_name) = field.file_name().map(str::to_string) else {
            let text = field.text().await.map_err(multipart_error)?;
            if name == BODY_PART {
                let parsed = serde_json::from_str(&text).map_err(|e| Error::BadRequest {
                    message: format!("Part '{BODY_PART}' must be a JSON document: {e}"),
                })?;
                explicit_body = Some(parsed);
            } else {
                insert_field(&mut fields, name, text);
            }
            continue;
        };

        if files.len() >= limits.max_files {
            return Err(Error::PayloadTooLarge {
                message: format!("At most {} files may be attached to a request", limits.max_files),
            });
        }

        let content_type = field
            .content_type()
            .filter(|ct| *ct != mime_guess::mime::APPLICATION_OCTET_STREAM.essence_str())
            .map(str::to_string)
            .unwrap_or_else(|| mime_guess::from_path(&file_name).first_or_octet_stream().to_string());

        let mut content = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            if (content.len() + chunk.len()) as u64 > limits.max_file_size {
                tracing::warn!(
                    field = %name,
                    file_name = %file_name,
                    max_file_size = limits.max_file_size,
                    "File size limit exceeded, rejecting request"
                );
                return Err(Error::PayloadTooLarge {
                    message: format!(
                        "File '{}' exceeds the maximum allowed size of {} bytes",
                        file_name, limits.max_file_size
                    ),
                });
            }
            content.extend_from_slice(&chunk);
        }

        tracing::debug!(
            index = files.len(),
            field = %name,
            file_name = %file_name,
            content_type = %content_type,
            bytes = content.len(),
            "Received attached file"
        );
        files.push(AttachedFile::new(name, content_type, content.freeze()));
    }

    let body = match explicit_body {
        Some(_) if !fields.is_empty() => {
            return Err(Error::BadRequest {
                message: format!("Part '{BODY_PART}' cannot be combined with other text fields"),
            });
        }
        Some(body) => body,
        None => Value::Object(fields),
    };
    Ok((body, files))
}

/// Repeated fields collect into an array, in arrival order
fn insert_field(fields: &mut Map<String, Value>, name: String, value: String) {
    match fields.get_mut(&name) {
        Some(Value::Array(values)) => values.push(Value::String(value)),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(value)]);
        }
        None => {
            fields.insert(name, Value::String(value));
        }
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> Error {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge { message: e.body_text() }
    } else {
        Error::BadRequest {
            message: format!("Failed to parse multipart data: {}", e.body_text()),
        }
    }
}
