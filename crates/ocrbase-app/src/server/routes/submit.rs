//! Direct submission endpoints: `POST /v1/parse` and `POST /v1/extract`.
//!
//! Both accept either multipart form data (`file` field plus metadata
//! fields) or a JSON body carrying a `url`. Exactly one source per
//! submission.

use axum::Json;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::pipeline::job::JobKind;
use crate::server::state::AppState;
use crate::services::{FilePayload, SchemaInput, SubmitRequest};

use super::{ApiError, JobSnapshot, require_auth};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    url: Option<String>,
    file_name: Option<String>,
    mime_type: Option<String>,
    schema_id: Option<String>,
    schema: Option<JsonValue>,
    hints: Option<String>,
    request_id: Option<String>,
}

pub async fn submit_parse(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<JobSnapshot>, ApiError> {
    submit(state, headers, request, JobKind::Parse).await
}

pub async fn submit_extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<JobSnapshot>, ApiError> {
    submit(state, headers, request, JobKind::Extract).await
}

async fn submit(
    state: AppState,
    headers: HeaderMap,
    request: Request,
    kind: JobKind,
) -> Result<Json<JobSnapshot>, ApiError> {
    let auth = require_auth(&state, &headers, None)?;

    let mut submit_request = if is_multipart(&headers) {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|error| ApiError::Validation(format!("invalid multipart body: {error}")))?;
        read_multipart(multipart).await?
    } else {
        let Json(body) = Json::<SubmitBody>::from_request(request, &())
            .await
            .map_err(|error| ApiError::Validation(format!("invalid json body: {error}")))?;
        from_json_body(body)
    };

    submit_request.tenant_id = auth.tenant_id;
    submit_request.submitter_id = auth.submitter_id;
    submit_request.kind = kind;

    let job = state.submission.submit(submit_request).await?;
    Ok(Json(JobSnapshot::from(&job)))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"))
}

fn from_json_body(body: SubmitBody) -> SubmitRequest {
    SubmitRequest {
        tenant_id: String::new(),
        submitter_id: String::new(),
        kind: JobKind::Parse,
        file: None,
        url: body.url,
        file_name: body.file_name,
        mime_type: body.mime_type,
        schema: schema_input(body.schema_id, body.schema),
        hints: body.hints,
        request_id: body.request_id,
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<SubmitRequest, ApiError> {
    let mut request = SubmitRequest {
        tenant_id: String::new(),
        submitter_id: String::new(),
        kind: JobKind::Parse,
        file: None,
        url: None,
        file_name: None,
        mime_type: None,
        schema: None,
        hints: None,
        request_id: None,
    };
    let mut schema_id = None;
    let mut inline_schema = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::Validation(format!("failed to read multipart field: {error}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "document".to_string());
                let content_type = field.content_type().map(str::to_string);
                let bytes: Bytes = field.bytes().await.map_err(|error| {
                    ApiError::Validation(format!("failed to read file field: {error}"))
                })?;
                request.file = Some(FilePayload {
                    file_name,
                    mime_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
                    bytes,
                });
            }
            "url" => request.url = Some(read_text_field(field).await?),
            "fileName" => request.file_name = Some(read_text_field(field).await?),
            "mimeType" => request.mime_type = Some(read_text_field(field).await?),
            "schemaId" => schema_id = Some(read_text_field(field).await?),
            "schema" => {
                let raw = read_text_field(field).await?;
                let value = serde_json::from_str(&raw).map_err(|error| {
                    ApiError::Validation(format!("schema field is not valid JSON: {error}"))
                })?;
                inline_schema = Some(value);
            }
            "hints" => request.hints = Some(read_text_field(field).await?),
            "requestId" => request.request_id = Some(read_text_field(field).await?),
            other => {
                tracing::debug!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    // An explicit mimeType field overrides the part's content type.
    if let (Some(mime), Some(file)) = (request.mime_type.clone(), request.file.as_mut()) {
        file.mime_type = mime;
    }
    if let (Some(name), Some(file)) = (request.file_name.clone(), request.file.as_mut()) {
        file.file_name = name;
    }
    request.schema = schema_input(schema_id, inline_schema);
    Ok(request)
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|error| ApiError::Validation(format!("failed to read multipart field: {error}")))
}

fn schema_input(schema_id: Option<String>, inline: Option<JsonValue>) -> Option<SchemaInput> {
    match (schema_id, inline) {
        (Some(id), _) => Some(SchemaInput::Reference(id)),
        (None, Some(value)) => Some(SchemaInput::Inline(value)),
        (None, None) => None,
    }
}
