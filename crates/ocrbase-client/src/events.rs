//! Wire types shared with the service. Parsers dispatch on the `type`
//! discriminator before touching any payload.

use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RealtimeEvent {
    Status {
        job_id: String,
        data: StatusData,
    },
    Completed {
        job_id: String,
        data: CompletedData,
    },
    Error {
        job_id: String,
        data: ErrorData,
    },
    Pong {
        job_id: String,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedData {
    pub status: String,
    #[serde(default)]
    pub markdown_result: Option<String>,
    #[serde(default)]
    pub json_result: Option<JsonValue>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    /// `failed` when the job itself failed; absent for transport errors.
    #[serde(default)]
    pub status: Option<String>,
    pub error: String,
}

impl ErrorData {
    pub fn is_job_failure(&self) -> bool {
        self.status.as_deref() == Some("failed")
    }
}

/// Authoritative job snapshot, as returned by `GET /v1/jobs/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub markdown_result: Option<String>,
    #[serde(default)]
    pub json_result: Option<JsonValue>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    #[serde(default)]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub token_count: Option<u64>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed")
    }
}
