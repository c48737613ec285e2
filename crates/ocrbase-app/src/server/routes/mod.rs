pub mod jobs;
pub mod realtime;
pub mod submit;
pub mod uploads;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::pipeline::job::{ErrorCode, Job, JobKind, JobSource, JobStatus};
use crate::server::auth::AuthContext;
use crate::server::state::AppState;
use crate::services::SubmitError;

/// Error surface of the HTTP API. Cross-tenant access is reported as
/// not-found so resource existence does not leak across tenants.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound,
    Validation(String),
    AlreadyConfirmed(String),
    Upstream(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::AlreadyConfirmed(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION",
            ApiError::AlreadyConfirmed(_) => "ALREADY_CONFIRMED",
            ApiError::Upstream(_) | ApiError::Internal(_) => "INTERNAL",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized => "missing or invalid credentials".to_string(),
            ApiError::NotFound => "resource not found".to_string(),
            ApiError::Validation(message)
            | ApiError::AlreadyConfirmed(message)
            | ApiError::Upstream(message)
            | ApiError::Internal(message) => message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
struct ApiErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code().to_string(),
                message: self.message(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match &error {
            SubmitError::Validation(_) | SubmitError::Schema(_) | SubmitError::UploadMissing(_) => {
                ApiError::Validation(error.to_string())
            }
            SubmitError::NotFound(_) => ApiError::NotFound,
            SubmitError::AlreadyConfirmed(_) => ApiError::AlreadyConfirmed(error.to_string()),
            SubmitError::Upload(_) | SubmitError::Enqueue(_) => {
                ApiError::Upstream(error.to_string())
            }
            SubmitError::Store(_) | SubmitError::SchemaStore(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

/// Resolve the caller or fail with 401.
pub fn require_auth(
    state: &AppState,
    headers: &HeaderMap,
    query_api_key: Option<&str>,
) -> Result<AuthContext, ApiError> {
    state
        .auth
        .authenticate(headers, query_api_key)
        .ok_or(ApiError::Unauthorized)
}

/// Wire form of a job row.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_upload: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        let (blob_key, source_url, pending_upload) = match &job.source {
            JobSource::Blob { blob_key } => (Some(blob_key.clone()), None, None),
            JobSource::Url { source_url } => (None, Some(source_url.clone()), None),
            JobSource::PendingUpload { blob_key } => (None, None, Some(blob_key.clone())),
        };
        Self {
            id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            kind: job.kind,
            status: job.status,
            blob_key,
            source_url,
            pending_upload,
            file_name: job.file_name.clone(),
            mime_type: job.mime_type.clone(),
            file_size: job.file_size,
            schema_ref: job.schema_ref.clone(),
            hints: job.hints.clone(),
            markdown_result: job.markdown_result.clone(),
            json_result: job.json_result_value(),
            error_code: job.error_code,
            error_message: job.error_message.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            processing_time_ms: job.processing_time_ms,
            page_count: job.page_count,
            llm_model: job.llm_model.clone(),
            token_count: job.token_count,
            created_at: job.created_at_ms,
            started_at: job.started_at_ms,
            completed_at: job.completed_at_ms,
            updated_at: job.updated_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::Job;

    #[test]
    fn snapshot_wire_shape_uses_camel_case_and_type() {
        let mut job = Job::new(
            "org_a",
            "user_a",
            JobKind::Extract,
            JobSource::Url {
                source_url: "https://example.com/a.pdf".to_string(),
            },
            "a.pdf",
            "application/pdf",
            7,
        );
        job.json_result = Some(r#"{"total": 3}"#.to_string());

        let value = serde_json::to_value(JobSnapshot::from(&job)).expect("encode");
        assert_eq!(value["type"], "extract");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["sourceUrl"], "https://example.com/a.pdf");
        assert_eq!(value["jsonResult"]["total"], 3);
        assert!(value.get("blobKey").is_none());
        assert!(value.get("errorCode").is_none());
        assert!(value.get("tenantId").is_some());
    }
}
