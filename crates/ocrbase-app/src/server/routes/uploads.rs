//! Presigned two-phase upload endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::pipeline::job::JobKind;
use crate::server::state::AppState;
use crate::services::{PresignError, PresignRequest, SchemaInput};

use super::{ApiError, JobSnapshot, require_auth};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignBody {
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    file_name: String,
    mime_type: String,
    schema_id: Option<String>,
    schema: Option<JsonValue>,
    hints: Option<String>,
}

fn default_kind() -> String {
    "parse".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub job_id: String,
    pub upload_url: String,
}

/// `POST /v1/uploads/presign` — reserve a key and mint the upload URL.
/// The job stays pending with no work item until `complete`.
pub async fn presign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PresignBody>,
) -> Result<Json<PresignResponse>, ApiError> {
    let auth = require_auth(&state, &headers, None)?;
    let kind = match body.kind.as_str() {
        "parse" => JobKind::Parse,
        "extract" => JobKind::Extract,
        other => {
            return Err(ApiError::Validation(format!(
                "unknown job type `{other}`"
            )));
        }
    };

    let schema = match (body.schema_id, body.schema) {
        (Some(id), _) => Some(SchemaInput::Reference(id)),
        (None, Some(value)) => Some(SchemaInput::Inline(value)),
        (None, None) => None,
    };

    let presigned = state.submission.presign(PresignRequest {
        tenant_id: auth.tenant_id,
        submitter_id: auth.submitter_id,
        kind,
        file_name: body.file_name,
        mime_type: body.mime_type,
        schema,
        hints: body.hints,
    })?;

    Ok(Json(PresignResponse {
        job_id: presigned.job.id,
        upload_url: presigned.upload_url,
    }))
}

/// `POST /v1/uploads/{job_id}/complete` — verify the object landed, then
/// enqueue exactly one work item.
pub async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let auth = require_auth(&state, &headers, None)?;
    let job = state.submission.confirm(&auth.tenant_id, &job_id).await?;
    Ok(Json(JobSnapshot::from(&job)))
}

/// `PUT /v1/uploads/put/{token}` — the app-served presigned upload
/// target. The token is the credential; it binds key, mime type, and
/// expiry under a keyed MAC.
pub async fn put_presigned(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let claims = state.signer.verify(&token).map_err(|error| match error {
        PresignError::Expired => ApiError::Validation("upload token expired".to_string()),
        PresignError::Malformed | PresignError::BadSignature => ApiError::Unauthorized,
    })?;

    if body.len() as u64 > state.max_upload_bytes {
        return Err(ApiError::Validation(format!(
            "upload of {} bytes exceeds the {} byte limit",
            body.len(),
            state.max_upload_bytes
        )));
    }

    state
        .blobs
        .put(&claims.blob_key, body, &claims.mime_type)
        .await
        .map_err(|error| ApiError::Upstream(format!("blob store: {error}")))?;
    tracing::info!(blob_key = %claims.blob_key, "presigned upload stored");
    Ok(StatusCode::NO_CONTENT)
}
