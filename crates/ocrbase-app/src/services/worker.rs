//! The job state machine. Each queue attempt drives one pass:
//! fetch input, OCR to markdown, optionally project through the LLM, and
//! persist the terminal row. Every transition is durable before the next
//! step begins, and every terminal write precedes its event.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::pipeline::events::{JobEvent, job_channel};
use crate::pipeline::job::{
    ErrorCode, Job, JobKind, JobPatch, JobSource, JobStatus, current_timestamp_ms,
};

use super::blob_store::{BlobError, BlobStore};
use super::event_bus::EventBus;
use super::extract::{ExtractError, StructuredExtractor};
use super::job_store::JobStore;
use super::ocr::{OcrEngine, OcrError, is_transient_status};
use super::queue::{JobOutcome, WorkHandler, WorkItem};
use super::schema_store::SchemaStore;

/// Classified failure of one attempt.
#[derive(Debug)]
struct AttemptFailure {
    code: ErrorCode,
    message: String,
    retryable: bool,
}

impl AttemptFailure {
    fn unrecoverable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

type AttemptResult<T> = Result<T, AttemptFailure>;

pub struct JobWorker {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    schemas: Arc<dyn SchemaStore>,
    ocr: Arc<dyn OcrEngine>,
    extractor: StructuredExtractor,
    bus: EventBus,
    http: reqwest::Client,
    attempt_timeout: Duration,
}

impl JobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        schemas: Arc<dyn SchemaStore>,
        ocr: Arc<dyn OcrEngine>,
        extractor: StructuredExtractor,
        bus: EventBus,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            blobs,
            schemas,
            ocr,
            extractor,
            bus,
            http: reqwest::Client::new(),
            attempt_timeout,
        }
    }

    fn publish(&self, job_id: &str, event: JobEvent) {
        if let Err(error) = self.bus.publish(&job_channel(job_id), event) {
            tracing::warn!(job_id, %error, "failed to publish job event");
        }
    }

    fn patch(&self, job_id: &str, patch: JobPatch) -> AttemptResult<Job> {
        self.jobs.update(job_id, patch).map_err(|error| {
            AttemptFailure::retryable(ErrorCode::Internal, format!("job store: {error}"))
        })
    }

    async fn run_attempt(&self, item: &WorkItem) -> AttemptResult<()> {
        let job = self
            .jobs
            .get(&item.job_id)
            .map_err(|error| {
                AttemptFailure::retryable(ErrorCode::Internal, format!("job store: {error}"))
            })?
            .ok_or_else(|| {
                AttemptFailure::unrecoverable(
                    ErrorCode::JobNotFound,
                    format!("job `{}` not in store", item.job_id),
                )
            })?;

        // At-least-once delivery: a re-delivered item for a finished job
        // acknowledges without work.
        if job.is_terminal() {
            tracing::debug!(job_id = %job.id, status = %job.status, "job already terminal");
            return Ok(());
        }

        let attempt_patch = JobPatch {
            status: Some(JobStatus::Processing),
            started_at_ms: job.started_at_ms.is_none().then(current_timestamp_ms),
            attempts_made: Some(item.attempts_made.saturating_add(1)),
            ..JobPatch::default()
        };
        let was_pending = job.status == JobStatus::Pending;
        let mut job = if job.status == JobStatus::Extracting {
            // A prior attempt already reached the extract stage; do not
            // regress the visible status.
            self.patch(
                &job.id,
                JobPatch {
                    attempts_made: Some(item.attempts_made.saturating_add(1)),
                    ..JobPatch::default()
                },
            )?
        } else {
            self.patch(&job.id, attempt_patch)?
        };
        if was_pending {
            self.publish(&job.id, JobEvent::status(&job));
        }

        // OCR runs only when a prior attempt did not persist markdown.
        let markdown = match job.markdown_result.clone() {
            Some(existing) => existing,
            None => {
                let (bytes, mime) = self.obtain_input(&mut job).await?;
                let outcome = self.ocr.parse(&bytes, &mime).await.map_err(classify_ocr)?;
                tracing::info!(
                    job_id = %job.id,
                    pages = outcome.page_count,
                    "ocr produced markdown"
                );
                job = self.patch(
                    &job.id,
                    JobPatch {
                        markdown_result: Some(outcome.markdown.clone()),
                        page_count: Some(outcome.page_count),
                        ..JobPatch::default()
                    },
                )?;
                outcome.markdown
            }
        };

        match job.kind {
            JobKind::Parse => self.finish(&job, JobPatch::default()),
            JobKind::Extract => self.run_extract(job, &markdown).await,
        }
    }

    async fn run_extract(&self, job: Job, markdown: &str) -> AttemptResult<()> {
        let schema_ref = job.schema_ref.clone().ok_or_else(|| {
            AttemptFailure::unrecoverable(ErrorCode::SchemaNotFound, "job has no schema reference")
        })?;
        let schema = self
            .schemas
            .get(&schema_ref)
            .map_err(|error| {
                AttemptFailure::retryable(ErrorCode::Internal, format!("schema store: {error}"))
            })?
            .ok_or_else(|| {
                AttemptFailure::unrecoverable(
                    ErrorCode::SchemaNotFound,
                    format!("schema `{schema_ref}` not found"),
                )
            })?;

        let job = if job.status == JobStatus::Extracting {
            job
        } else {
            let job = self.patch(&job.id, JobPatch::status(JobStatus::Extracting))?;
            self.publish(&job.id, JobEvent::status(&job));
            job
        };

        let extraction = self
            .extractor
            .extract(markdown, &schema, job.hints.as_deref())
            .await
            .map_err(classify_extract)?;

        self.finish(
            &job,
            JobPatch {
                json_result: Some(extraction.data.to_string()),
                llm_model: Some(extraction.model),
                token_count: Some(extraction.token_count),
                ..JobPatch::default()
            },
        )
    }

    /// Terminal `completed` write, then the event. Result fields ride in
    /// the same patch so no reader ever observes them on a non-terminal
    /// row.
    fn finish(&self, job: &Job, mut patch: JobPatch) -> AttemptResult<()> {
        let now_ms = current_timestamp_ms();
        let elapsed = job
            .started_at_ms
            .map(|started| now_ms.saturating_sub(started).max(0) as u64)
            .unwrap_or(0);
        patch.status = Some(JobStatus::Completed);
        patch.processing_time_ms = Some(elapsed);
        patch.completed_at_ms = Some(now_ms);
        // Errors recorded by earlier attempts do not survive a successful
        // terminal write.
        patch.error_code = Some(None);
        patch.error_message = Some(None);
        let job = self.patch(&job.id, patch)?;
        tracing::info!(
            job_id = %job.id,
            processing_time_ms = elapsed,
            "job completed"
        );
        self.publish(&job.id, JobEvent::completed(&job));
        Ok(())
    }

    async fn obtain_input(&self, job: &mut Job) -> AttemptResult<(Bytes, String)> {
        match job.source.clone() {
            JobSource::Blob { blob_key } => {
                let bytes = self
                    .blobs
                    .get(&blob_key)
                    .await
                    .map_err(classify_blob)?;
                Ok((bytes, job.mime_type.clone()))
            }
            JobSource::Url { source_url } => self.fetch_url(job, &source_url).await,
            JobSource::PendingUpload { .. } => Err(AttemptFailure::unrecoverable(
                ErrorCode::NoSource,
                "upload was never confirmed",
            )),
        }
    }

    async fn fetch_url(&self, job: &mut Job, url: &str) -> AttemptResult<(Bytes, String)> {
        let response = self.http.get(url).send().await.map_err(|error| {
            AttemptFailure::retryable(ErrorCode::FetchFailed, format!("GET {url}: {error}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let failure = AttemptFailure {
                code: ErrorCode::FetchFailed,
                message: format!("GET {url} returned {status}"),
                retryable: is_transient_status(status.as_u16()),
            };
            return Err(failure);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());

        let bytes = response.bytes().await.map_err(|error| {
            AttemptFailure::retryable(ErrorCode::FetchFailed, format!("read body: {error}"))
        })?;

        // Refine informational metadata with what the origin reported.
        let mime = content_type.unwrap_or_else(|| job.mime_type.clone());
        *job = self.patch(
            &job.id,
            JobPatch {
                mime_type: Some(mime.clone()),
                file_size: Some(bytes.len() as u64),
                ..JobPatch::default()
            },
        )?;
        Ok((bytes, mime))
    }

    /// Record the most recent attempt error on the row without leaving the
    /// non-terminal status; the queue's terminal callback owns the flip to
    /// `failed`.
    fn record_attempt_error(&self, job_id: &str, failure: &AttemptFailure) {
        let patch = JobPatch::attempt_error(failure.code, failure.message.clone());
        if let Err(error) = self.jobs.update(job_id, patch) {
            tracing::warn!(job_id, %error, "failed to record attempt error");
        }
    }
}

#[async_trait::async_trait]
impl WorkHandler for JobWorker {
    async fn handle(&self, item: &WorkItem) -> JobOutcome {
        let attempt = tokio::time::timeout(self.attempt_timeout, self.run_attempt(item)).await;
        let failure = match attempt {
            Ok(Ok(())) => return JobOutcome::Completed,
            Ok(Err(failure)) => failure,
            Err(_) => AttemptFailure::retryable(
                ErrorCode::Timeout,
                format!(
                    "attempt exceeded {}ms deadline",
                    self.attempt_timeout.as_millis()
                ),
            ),
        };

        tracing::warn!(
            job_id = %item.job_id,
            code = %failure.code,
            retryable = failure.retryable,
            error = %failure.message,
            "job attempt failed"
        );
        self.record_attempt_error(&item.job_id, &failure);

        if failure.retryable {
            JobOutcome::Retry {
                code: failure.code,
                message: failure.message,
            }
        } else {
            JobOutcome::Fail {
                code: failure.code,
                message: failure.message,
            }
        }
    }

    async fn on_terminal_failure(&self, item: &WorkItem, code: ErrorCode, message: &str) {
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            error_code: Some(Some(code)),
            error_message: Some(Some(message.to_string())),
            completed_at_ms: Some(current_timestamp_ms()),
            ..JobPatch::default()
        };
        match self.jobs.update(&item.job_id, patch) {
            Ok(job) => {
                tracing::error!(job_id = %job.id, %code, error = message, "job failed");
                self.publish(&job.id, JobEvent::job_failed(&job.id, code, message));
            }
            Err(error) => {
                tracing::error!(job_id = %item.job_id, %error, "failed to mark job failed");
            }
        }
    }
}

fn classify_ocr(error: OcrError) -> AttemptFailure {
    AttemptFailure {
        code: ErrorCode::OcrFailed,
        retryable: error.is_retryable(),
        message: error.to_string(),
    }
}

fn classify_blob(error: BlobError) -> AttemptFailure {
    match &error {
        BlobError::NotFound(_) | BlobError::InvalidKey(_) => {
            AttemptFailure::unrecoverable(ErrorCode::FetchFailed, error.to_string())
        }
        BlobError::Io { .. } => AttemptFailure::retryable(ErrorCode::FetchFailed, error.to_string()),
    }
}

fn classify_extract(error: ExtractError) -> AttemptFailure {
    match &error {
        ExtractError::ParseFailed { .. } => {
            AttemptFailure::unrecoverable(ErrorCode::LlmParseFailed, error.to_string())
        }
        ExtractError::Llm(inner) => AttemptFailure {
            code: ErrorCode::LlmFailed,
            retryable: inner.is_retryable(),
            message: error.to_string(),
        },
    }
}
