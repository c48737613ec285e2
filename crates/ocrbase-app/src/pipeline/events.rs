//! Realtime event variants published per job.
//!
//! Events are transient; the job store remains the source of truth for
//! terminal state. Parsers dispatch on the `type` discriminator before
//! touching any payload field.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::job::{ErrorCode, Job, JobStatus};

/// Channel name carrying events for one job.
pub fn job_channel(job_id: &str) -> String {
    debug_assert!(!job_id.is_empty());
    format!("job:{job_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum JobEvent {
    Status {
        job_id: String,
        data: StatusPayload,
    },
    Completed {
        job_id: String,
        data: CompletedPayload,
    },
    Error {
        job_id: String,
        data: ErrorPayload,
    },
    Pong {
        job_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPayload {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Present (as `failed`) only when the job itself failed. Transport
    /// failures omit it so clients can tell the two apart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    pub error: String,
}

impl JobEvent {
    pub fn status(job: &Job) -> Self {
        JobEvent::Status {
            job_id: job.id.clone(),
            data: StatusPayload { status: job.status },
        }
    }

    /// Terminal `completed` event sourced from a durable row.
    pub fn completed(job: &Job) -> Self {
        debug_assert!(job.status == JobStatus::Completed);
        JobEvent::Completed {
            job_id: job.id.clone(),
            data: CompletedPayload {
                status: JobStatus::Completed,
                markdown_result: job.markdown_result.clone(),
                json_result: job.json_result_value(),
                processing_time_ms: job.processing_time_ms,
            },
        }
    }

    /// Terminal `error` event for a failed job.
    pub fn job_failed(job_id: &str, code: ErrorCode, message: &str) -> Self {
        JobEvent::Error {
            job_id: job_id.to_string(),
            data: ErrorPayload {
                status: Some(JobStatus::Failed),
                error: format!("{code}: {message}"),
            },
        }
    }

    /// Non-terminal `error` event for stream/transport trouble.
    pub fn transport_error(job_id: &str, message: impl Into<String>) -> Self {
        JobEvent::Error {
            job_id: job_id.to_string(),
            data: ErrorPayload {
                status: None,
                error: message.into(),
            },
        }
    }

    pub fn pong(job_id: &str) -> Self {
        JobEvent::Pong {
            job_id: job_id.to_string(),
        }
    }

    /// Re-derive the terminal event for a job that already finished, used
    /// by subscribers that bind after publish.
    pub fn synthesize_terminal(job: &Job) -> Option<Self> {
        match job.status {
            JobStatus::Completed => Some(JobEvent::completed(job)),
            JobStatus::Failed => {
                let code = job.error_code.unwrap_or(ErrorCode::JobNotFound);
                let message = job.error_message.as_deref().unwrap_or("job failed");
                Some(JobEvent::job_failed(&job.id, code, message))
            }
            _ => None,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Status { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Error { job_id, .. }
            | JobEvent::Pong { job_id } => job_id,
        }
    }

    /// Wire name of the variant, used for SSE `event:` lines.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Status { .. } => "status",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Error { .. } => "error",
            JobEvent::Pong { .. } => "pong",
        }
    }

    /// Terminal events end a realtime stream; pongs and status updates do
    /// not. A transport error (no `status: failed`) is also terminal for
    /// the stream even though the job may still be running.
    pub fn ends_stream(&self) -> bool {
        match self {
            JobEvent::Completed { .. } | JobEvent::Error { .. } => true,
            JobEvent::Status { .. } | JobEvent::Pong { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::{JobKind, JobPatch, JobSource};

    fn completed_job() -> Job {
        let mut job = Job::new(
            "org_a",
            "user_a",
            JobKind::Extract,
            JobSource::Blob {
                blob_key: "org_a/jobs/job_x/invoice.png".to_string(),
            },
            "invoice.png",
            "image/png",
            2048,
        );
        JobPatch::status(JobStatus::Processing)
            .apply(&mut job)
            .expect("to processing");
        job.markdown_result = Some("# Invoice".to_string());
        job.json_result = Some(r#"{"total": 10}"#.to_string());
        JobPatch::status(JobStatus::Extracting)
            .apply(&mut job)
            .expect("to extracting");
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            processing_time_ms: Some(1200),
            ..JobPatch::default()
        };
        patch.apply(&mut job).expect("to completed");
        job
    }

    #[test]
    fn completed_event_wire_shape() {
        let job = completed_job();
        let event = JobEvent::completed(&job);
        let value = serde_json::to_value(&event).expect("encode");

        assert_eq!(value["type"], "completed");
        assert_eq!(value["jobId"], job.id);
        assert_eq!(value["data"]["status"], "completed");
        assert_eq!(value["data"]["markdownResult"], "# Invoice");
        assert_eq!(value["data"]["jsonResult"]["total"], 10);
        assert_eq!(value["data"]["processingTimeMs"], 1200);
    }

    #[test]
    fn job_failure_carries_failed_status() {
        let event = JobEvent::job_failed("job_1", ErrorCode::FetchFailed, "503 from origin");
        let value = serde_json::to_value(&event).expect("encode");

        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["status"], "failed");
        assert!(
            value["data"]["error"]
                .as_str()
                .expect("error string")
                .starts_with("FETCH_FAILED")
        );
    }

    #[test]
    fn transport_error_omits_failed_status() {
        let event = JobEvent::transport_error("job_1", "event bus unavailable");
        let value = serde_json::to_value(&event).expect("encode");

        assert_eq!(value["type"], "error");
        assert!(value["data"].get("status").is_none());
    }

    #[test]
    fn discriminator_round_trips() {
        let event = JobEvent::pong("job_9");
        let raw = serde_json::to_string(&event).expect("encode");
        let back: JobEvent = serde_json::from_str(&raw).expect("decode");
        assert_eq!(back, event);
        assert_eq!(back.kind(), "pong");
        assert!(!back.ends_stream());
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let raw = r#"{"type":"progress","jobId":"job_1","data":{}}"#;
        assert!(serde_json::from_str::<JobEvent>(raw).is_err());
    }

    #[test]
    fn synthesize_terminal_for_running_job_is_none() {
        let mut job = completed_job();
        assert!(JobEvent::synthesize_terminal(&job).is_some());
        job.status = JobStatus::Processing;
        assert!(JobEvent::synthesize_terminal(&job).is_none());
    }
}
