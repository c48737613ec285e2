use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Lifecycle state of a job. Transitions are monotonic toward a terminal
/// state; `Completed` and `Failed` are never left.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Extracting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the status DAG permits moving from `self` to `next`.
    pub fn can_transition(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Processing | JobStatus::Failed
            ),
            JobStatus::Processing => matches!(
                next,
                JobStatus::Extracting | JobStatus::Completed | JobStatus::Failed
            ),
            JobStatus::Extracting => {
                matches!(next, JobStatus::Completed | JobStatus::Failed)
            }
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }
}

/// What a job produces: markdown only, or markdown plus a JSON projection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobKind {
    Parse,
    Extract,
}

/// Exactly one input source per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Blob { blob_key: String },
    Url { source_url: String },
    PendingUpload { blob_key: String },
}

impl JobSource {
    pub fn blob_key(&self) -> Option<&str> {
        match self {
            JobSource::Blob { blob_key } | JobSource::PendingUpload { blob_key } => {
                Some(blob_key.as_str())
            }
            JobSource::Url { .. } => None,
        }
    }

    pub fn source_url(&self) -> Option<&str> {
        match self {
            JobSource::Url { source_url } => Some(source_url.as_str()),
            _ => None,
        }
    }
}

/// Stable failure codes persisted on the job row and surfaced on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UploadFailed,
    EnqueueFailed,
    JobNotFound,
    NoSource,
    FetchFailed,
    OcrFailed,
    SchemaNotFound,
    LlmFailed,
    LlmParseFailed,
    Timeout,
    Validation,
    AlreadyConfirmed,
    Internal,
}

/// Durable record of one unit of document processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub submitter_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub source: JobSource,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub schema_ref: Option<String>,
    pub hints: Option<String>,
    pub markdown_result: Option<String>,
    /// JSON text of the extraction result. Stored as text so the record
    /// encodes with a non-self-describing codec; parse with
    /// [`Job::json_result_value`].
    pub json_result: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub attempts_made: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub processing_time_ms: Option<u64>,
    pub page_count: Option<u32>,
    pub llm_model: Option<String>,
    pub token_count: Option<u64>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub updated_at_ms: i64,
}

impl Job {
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        submitter_id: impl Into<String>,
        kind: JobKind,
        source: JobSource,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        file_size: u64,
    ) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            id: new_job_id(),
            tenant_id: tenant_id.into(),
            submitter_id: submitter_id.into(),
            kind,
            status: JobStatus::Pending,
            source,
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            file_size,
            schema_ref: None,
            hints: None,
            markdown_result: None,
            json_result: None,
            error_code: None,
            error_message: None,
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            processing_time_ms: None,
            page_count: None,
            llm_model: None,
            token_count: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            updated_at_ms: now_ms,
        }
    }

    pub fn json_result_value(&self) -> Option<JsonValue> {
        self.json_result
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Field-scoped partial update. Only fields explicitly set are merged, so
/// writers touching disjoint fields do not clobber each other.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub source: Option<JobSource>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
    pub markdown_result: Option<String>,
    pub json_result: Option<String>,
    pub error_code: Option<Option<ErrorCode>>,
    pub error_message: Option<Option<String>>,
    pub attempts_made: Option<u32>,
    pub processing_time_ms: Option<u64>,
    pub page_count: Option<u32>,
    pub llm_model: Option<String>,
    pub token_count: Option<u64>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl JobPatch {
    #[must_use]
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn attempt_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(Some(code)),
            error_message: Some(Some(message.into())),
            ..Self::default()
        }
    }

    /// Apply the patch to a job in place. Returns an error when the patch
    /// would move the status against the lifecycle DAG; terminal rows admit
    /// no status change at all.
    pub fn apply(self, job: &mut Job) -> Result<(), IllegalTransition> {
        if let Some(next) = self.status {
            if !job.status.can_transition(next) {
                return Err(IllegalTransition {
                    job_id: job.id.clone(),
                    from: job.status,
                    to: next,
                });
            }
            job.status = next;
        }
        if let Some(source) = self.source {
            job.source = source;
        }
        if let Some(mime_type) = self.mime_type {
            job.mime_type = mime_type;
        }
        if let Some(file_size) = self.file_size {
            job.file_size = file_size;
        }
        if let Some(markdown) = self.markdown_result {
            job.markdown_result = Some(markdown);
        }
        if let Some(json) = self.json_result {
            job.json_result = Some(json);
        }
        if let Some(code) = self.error_code {
            job.error_code = code;
        }
        if let Some(message) = self.error_message {
            job.error_message = message;
        }
        if let Some(attempts) = self.attempts_made {
            job.attempts_made = attempts;
        }
        if let Some(elapsed) = self.processing_time_ms {
            job.processing_time_ms = Some(elapsed);
        }
        if let Some(pages) = self.page_count {
            job.page_count = Some(pages);
        }
        if let Some(model) = self.llm_model {
            job.llm_model = Some(model);
        }
        if let Some(tokens) = self.token_count {
            job.token_count = Some(tokens);
        }
        if let Some(started) = self.started_at_ms {
            job.started_at_ms = Some(started);
        }
        if let Some(completed) = self.completed_at_ms {
            job.completed_at_ms = Some(completed);
        }
        job.updated_at_ms = current_timestamp_ms();
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("job `{job_id}` cannot transition {from} -> {to}")]
pub struct IllegalTransition {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

pub fn new_job_id() -> String {
    format!("job_{}", Uuid::new_v4().simple())
}

pub fn new_schema_id() -> String {
    format!("schema_{}", Uuid::new_v4().simple())
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;

    fn sample_job(kind: JobKind) -> Job {
        Job::new(
            "org_a",
            "user_a",
            kind,
            JobSource::Url {
                source_url: "https://example.com/doc.pdf".to_string(),
            },
            "doc.pdf",
            "application/pdf",
            1024,
        )
    }

    #[test]
    fn new_job_has_pending_defaults() {
        let job = sample_job(JobKind::Parse);

        assert!(job.id.starts_with("job_"));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.markdown_result.is_none());
        assert!(job.error_code.is_none());
        assert!(!job.is_terminal());
    }

    #[test]
    fn patch_merges_only_set_fields() {
        let mut job = sample_job(JobKind::Extract);
        let before_source = job.source.clone();

        let patch = JobPatch {
            status: Some(JobStatus::Processing),
            started_at_ms: Some(42),
            ..JobPatch::default()
        };
        patch.apply(&mut job).expect("legal transition");

        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at_ms, Some(42));
        assert_eq!(job.source, before_source);
        assert_eq!(job.file_name, "doc.pdf");
    }

    #[test]
    fn terminal_status_rejects_further_transitions() {
        let mut job = sample_job(JobKind::Parse);
        JobPatch::status(JobStatus::Processing)
            .apply(&mut job)
            .expect("pending -> processing");
        JobPatch::status(JobStatus::Completed)
            .apply(&mut job)
            .expect("processing -> completed");

        let err = JobPatch::status(JobStatus::Processing)
            .apply(&mut job)
            .expect_err("completed is terminal");
        assert_eq!(err.from, JobStatus::Completed);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn pending_cannot_jump_to_extracting() {
        let mut job = sample_job(JobKind::Extract);
        let result = JobPatch::status(JobStatus::Extracting).apply(&mut job);
        assert!(result.is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn error_code_wire_form_is_screaming_snake() {
        let raw = serde_json::to_string(&ErrorCode::LlmParseFailed).expect("encode");
        assert_eq!(raw, "\"LLM_PARSE_FAILED\"");
        assert_eq!(ErrorCode::FetchFailed.as_ref(), "FETCH_FAILED");
    }

    #[test]
    fn json_result_parses_lazily() {
        let mut job = sample_job(JobKind::Extract);
        job.json_result = Some(r#"{"total": 12.5}"#.to_string());
        let value = job.json_result_value().expect("parse");
        assert_eq!(value["total"], 12.5);
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Processing),
            Just(JobStatus::Extracting),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
        ]
    }

    proptest! {
        // No sequence of patches ever escapes a terminal state.
        #[test]
        fn prop_status_is_monotonic_toward_terminal(steps in proptest::collection::vec(status_strategy(), 1..16)) {
            let mut job = sample_job(JobKind::Parse);
            let mut reached_terminal: Option<JobStatus> = None;

            for next in steps {
                let _ = JobPatch::status(next).apply(&mut job);
                if let Some(terminal) = reached_terminal {
                    prop_assert_eq!(job.status, terminal);
                } else if job.status.is_terminal() {
                    reached_terminal = Some(job.status);
                }
            }
        }
    }

    /// The patch shapes the pipeline's writers actually issue: attempt
    /// starts, the mid-attempt markdown persist, attempt errors recorded
    /// while retries remain, the stage transition, and the two terminal
    /// writes. Guards mirror the worker's own ordering (no work after
    /// terminal, no completion without markdown).
    #[derive(Debug, Clone)]
    enum AttemptOp {
        StartAttempt,
        PersistMarkdown,
        RecordAttemptError(ErrorCode),
        BeginExtract,
        CompleteTerminal,
        FailTerminal(ErrorCode),
    }

    fn code_strategy() -> impl Strategy<Value = ErrorCode> {
        prop_oneof![
            Just(ErrorCode::FetchFailed),
            Just(ErrorCode::OcrFailed),
            Just(ErrorCode::LlmFailed),
            Just(ErrorCode::LlmParseFailed),
            Just(ErrorCode::Timeout),
        ]
    }

    fn op_strategy() -> impl Strategy<Value = AttemptOp> {
        prop_oneof![
            Just(AttemptOp::StartAttempt),
            Just(AttemptOp::PersistMarkdown),
            code_strategy().prop_map(AttemptOp::RecordAttemptError),
            Just(AttemptOp::BeginExtract),
            Just(AttemptOp::CompleteTerminal),
            code_strategy().prop_map(AttemptOp::FailTerminal),
        ]
    }

    fn apply_attempt_op(job: &mut Job, op: &AttemptOp) {
        if job.is_terminal() {
            return;
        }
        let patch = match op {
            AttemptOp::StartAttempt => JobPatch {
                status: Some(JobStatus::Processing),
                started_at_ms: job.started_at_ms.is_none().then_some(1),
                attempts_made: Some(job.attempts_made.saturating_add(1)),
                ..JobPatch::default()
            },
            AttemptOp::PersistMarkdown => {
                if job.status == JobStatus::Pending {
                    return;
                }
                JobPatch {
                    markdown_result: Some("# Doc".to_string()),
                    page_count: Some(1),
                    ..JobPatch::default()
                }
            }
            AttemptOp::RecordAttemptError(code) => {
                if job.status == JobStatus::Pending {
                    return;
                }
                JobPatch::attempt_error(*code, "attempt failed")
            }
            AttemptOp::BeginExtract => {
                if job.kind != JobKind::Extract || job.markdown_result.is_none() {
                    return;
                }
                JobPatch::status(JobStatus::Extracting)
            }
            AttemptOp::CompleteTerminal => {
                if job.markdown_result.is_none() {
                    return;
                }
                let mut patch = JobPatch {
                    status: Some(JobStatus::Completed),
                    processing_time_ms: Some(10),
                    completed_at_ms: Some(2),
                    error_code: Some(None),
                    error_message: Some(None),
                    ..JobPatch::default()
                };
                if job.kind == JobKind::Extract {
                    patch.json_result = Some(r#"{"total": 1}"#.to_string());
                    patch.llm_model = Some("extract-1".to_string());
                    patch.token_count = Some(3);
                }
                patch
            }
            AttemptOp::FailTerminal(code) => JobPatch {
                status: Some(JobStatus::Failed),
                error_code: Some(Some(*code)),
                error_message: Some(Some("attempts exhausted".to_string())),
                completed_at_ms: Some(2),
                ..JobPatch::default()
            },
        };
        let _ = patch.apply(job);
    }

    fn assert_pipeline_invariants(job: &Job) -> Result<(), TestCaseError> {
        prop_assert_eq!(
            job.json_result.is_some(),
            job.kind == JobKind::Extract && job.status == JobStatus::Completed,
            "json_result out of step: kind {:?}, status {:?}",
            job.kind,
            job.status
        );
        if job.status == JobStatus::Completed {
            prop_assert!(job.markdown_result.is_some());
            prop_assert!(job.error_code.is_none());
            prop_assert!(job.error_message.is_none());
        }
        if job.status == JobStatus::Failed {
            prop_assert!(job.error_code.is_some());
            prop_assert!(job.error_message.is_some());
        }
        // An error code on a live row only ever means an attempt failed
        // while retries remain; once terminal, error_code iff failed.
        if job.error_code.is_some() {
            prop_assert!(matches!(
                job.status,
                JobStatus::Processing | JobStatus::Extracting | JobStatus::Failed
            ));
        }
        Ok(())
    }

    proptest! {
        // json_result is present exactly on completed extract rows, and
        // error fields track terminal failure, at every observed state of
        // any worker-shaped patch sequence.
        #[test]
        fn prop_result_and_error_fields_track_kind_and_status(
            kind in prop_oneof![Just(JobKind::Parse), Just(JobKind::Extract)],
            ops in proptest::collection::vec(op_strategy(), 1..24),
        ) {
            let mut job = sample_job(kind);
            if kind == JobKind::Extract {
                job.schema_ref = Some("schema_inv".to_string());
            }
            assert_pipeline_invariants(&job)?;

            for op in &ops {
                apply_attempt_op(&mut job, op);
                assert_pipeline_invariants(&job)?;
            }
        }
    }
}
