//! Job admission: validate, create the durable row, place bytes, enqueue.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

use crate::pipeline::events::{JobEvent, job_channel};
use crate::pipeline::job::{
    ErrorCode, Job, JobKind, JobPatch, JobSource, JobStatus, current_timestamp_ms,
};
use crate::pipeline::schema::{SchemaDoc, SchemaError};

use super::blob_store::{BlobError, BlobStore, UploadSigner, job_blob_key};
use super::event_bus::EventBus;
use super::job_store::{JobStore, JobStoreError};
use super::ocr::is_supported_mime;
use super::queue::{QueueError, WorkItem, WorkQueue};
use super::schema_store::{SchemaStore, SchemaStoreError};

pub const MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_PRESIGN_TTL_MS: i64 = 15 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct SubmitLimits {
    pub max_file_size_bytes: u64,
    pub presign_ttl_ms: i64,
}

impl Default for SubmitLimits {
    fn default() -> Self {
        Self {
            max_file_size_bytes: MAX_FILE_SIZE_BYTES,
            presign_ttl_ms: DEFAULT_PRESIGN_TTL_MS,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("upload already confirmed for job `{0}`")]
    AlreadyConfirmed(String),
    #[error("no object found at the reserved upload key for job `{0}`")]
    UploadMissing(String),
    #[error("blob upload failed: {0}")]
    Upload(#[source] BlobError),
    #[error("enqueue failed: {0}")]
    Enqueue(#[source] QueueError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    SchemaStore(#[from] SchemaStoreError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Bytes handed over in a direct submission.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Schema handed over with an extract submission: a registry reference or
/// an inline document normalized at the boundary.
#[derive(Debug, Clone)]
pub enum SchemaInput {
    Reference(String),
    Inline(JsonValue),
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tenant_id: String,
    pub submitter_id: String,
    pub kind: JobKind,
    pub file: Option<FilePayload>,
    pub url: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub schema: Option<SchemaInput>,
    pub hints: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PresignRequest {
    pub tenant_id: String,
    pub submitter_id: String,
    pub kind: JobKind,
    pub file_name: String,
    pub mime_type: String,
    pub schema: Option<SchemaInput>,
    pub hints: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub job: Job,
    pub upload_url: String,
}

pub struct SubmissionService {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    schemas: Arc<dyn SchemaStore>,
    queue: Arc<WorkQueue>,
    bus: EventBus,
    signer: UploadSigner,
    public_base_url: String,
    limits: SubmitLimits,
}

impl SubmissionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        schemas: Arc<dyn SchemaStore>,
        queue: Arc<WorkQueue>,
        bus: EventBus,
        signer: UploadSigner,
        public_base_url: impl Into<String>,
        limits: SubmitLimits,
    ) -> Self {
        Self {
            jobs,
            blobs,
            schemas,
            queue,
            bus,
            signer,
            public_base_url: into_trimmed(public_base_url),
            limits,
        }
    }

    /// Direct and URL admission. Returns the job snapshot; admission
    /// failures after the row exists leave a terminal `failed` row behind.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job, SubmitError> {
        let schema_ref = self.resolve_schema(request.kind, request.schema.as_ref())?;

        match (&request.file, &request.url) {
            (Some(_), Some(_)) => {
                return Err(SubmitError::Validation(
                    "provide exactly one of `file` or `url`".to_string(),
                ));
            }
            (None, None) => {
                return Err(SubmitError::Validation(
                    "provide exactly one of `file` or `url`".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(file) = request.file {
            self.submit_file(request.tenant_id, request.submitter_id, request.kind, file, schema_ref, request.hints, request.request_id)
                .await
        } else if let Some(url) = request.url {
            self.submit_url(
                url,
                request.tenant_id,
                request.submitter_id,
                request.kind,
                request.file_name,
                request.mime_type,
                schema_ref,
                request.hints,
                request.request_id,
            )
            .await
        } else {
            unreachable!("validated above")
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_file(
        &self,
        tenant_id: String,
        submitter_id: String,
        kind: JobKind,
        file: FilePayload,
        schema_ref: Option<String>,
        hints: Option<String>,
        request_id: Option<String>,
    ) -> Result<Job, SubmitError> {
        validate_mime(&file.mime_type)?;
        validate_size(file.bytes.len() as u64, self.limits.max_file_size_bytes)?;

        let mut job = Job::new(
            tenant_id,
            submitter_id,
            kind,
            JobSource::PendingUpload {
                blob_key: String::new(),
            },
            file.file_name.clone(),
            file.mime_type.clone(),
            file.bytes.len() as u64,
        );
        let blob_key = job_blob_key(&job.tenant_id, &job.id, &file.file_name);
        job.source = JobSource::PendingUpload {
            blob_key: blob_key.clone(),
        };
        job.schema_ref = schema_ref;
        job.hints = hints;
        job.max_attempts = self.queue.config().max_attempts;
        self.jobs.insert(&job)?;
        tracing::info!(job_id = %job.id, kind = %job.kind, "job admitted");

        if let Err(error) = self
            .blobs
            .put(&blob_key, file.bytes, &file.mime_type)
            .await
        {
            self.fail_admission(&job.id, ErrorCode::UploadFailed, &error.to_string());
            return Err(SubmitError::Upload(error));
        }

        let job = self.jobs.update(
            &job.id,
            JobPatch {
                source: Some(JobSource::Blob { blob_key }),
                ..JobPatch::default()
            },
        )?;

        self.enqueue_job(&job, request_id)?;
        Ok(job)
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_url(
        &self,
        url: String,
        tenant_id: String,
        submitter_id: String,
        kind: JobKind,
        file_name: Option<String>,
        mime_type: Option<String>,
        schema_ref: Option<String>,
        hints: Option<String>,
        request_id: Option<String>,
    ) -> Result<Job, SubmitError> {
        let parsed = Url::parse(&url)
            .map_err(|error| SubmitError::Validation(format!("invalid url: {error}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SubmitError::Validation(format!(
                "url scheme `{}` is not http(s)",
                parsed.scheme()
            )));
        }
        if let Some(mime) = mime_type.as_deref() {
            validate_mime(mime)?;
        }

        let file_name = file_name.unwrap_or_else(|| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .unwrap_or("document")
                .to_string()
        });

        let mut job = Job::new(
            tenant_id,
            submitter_id,
            kind,
            JobSource::Url { source_url: url },
            file_name,
            mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            0,
        );
        job.schema_ref = schema_ref;
        job.hints = hints;
        job.max_attempts = self.queue.config().max_attempts;
        self.jobs.insert(&job)?;
        tracing::info!(job_id = %job.id, kind = %job.kind, "url job admitted");

        self.enqueue_job(&job, request_id)?;
        Ok(job)
    }

    /// Reserve a blob key, create the pending row, and return a
    /// MAC-signed, TTL-bounded upload URL. No work item yet.
    pub fn presign(&self, request: PresignRequest) -> Result<PresignedUpload, SubmitError> {
        validate_mime(&request.mime_type)?;
        let schema_ref = self.resolve_schema(request.kind, request.schema.as_ref())?;

        let mut job = Job::new(
            request.tenant_id,
            request.submitter_id,
            request.kind,
            JobSource::PendingUpload {
                blob_key: String::new(),
            },
            request.file_name.clone(),
            request.mime_type.clone(),
            0,
        );
        let blob_key = job_blob_key(&job.tenant_id, &job.id, &request.file_name);
        job.source = JobSource::PendingUpload {
            blob_key: blob_key.clone(),
        };
        job.schema_ref = schema_ref;
        job.hints = request.hints;
        job.max_attempts = self.queue.config().max_attempts;
        self.jobs.insert(&job)?;

        let token = self
            .signer
            .sign(&blob_key, &request.mime_type, self.limits.presign_ttl_ms);
        let upload_url = format!("{}/v1/uploads/put/{token}", self.public_base_url);
        tracing::info!(job_id = %job.id, "presigned upload issued");
        Ok(PresignedUpload { job, upload_url })
    }

    /// Second phase of the presigned flow: verify ownership, pending
    /// status, and object existence, then enqueue exactly once.
    pub async fn confirm(&self, tenant_id: &str, job_id: &str) -> Result<Job, SubmitError> {
        let job = self
            .jobs
            .get(job_id)?
            .filter(|job| job.tenant_id == tenant_id)
            .ok_or_else(|| SubmitError::NotFound(job_id.to_string()))?;

        if job.status != JobStatus::Pending {
            return Err(SubmitError::AlreadyConfirmed(job_id.to_string()));
        }
        let blob_key = match &job.source {
            JobSource::PendingUpload { blob_key } => blob_key.clone(),
            JobSource::Blob { .. } => {
                return Err(SubmitError::AlreadyConfirmed(job_id.to_string()));
            }
            JobSource::Url { .. } => {
                return Err(SubmitError::Validation(
                    "url jobs have no upload to confirm".to_string(),
                ));
            }
        };

        let exists = self
            .blobs
            .exists(&blob_key)
            .await
            .map_err(SubmitError::Upload)?;
        if !exists {
            return Err(SubmitError::UploadMissing(job_id.to_string()));
        }

        let file_size = self
            .blobs
            .get(&blob_key)
            .await
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);
        let job = self.jobs.update(
            job_id,
            JobPatch {
                source: Some(JobSource::Blob { blob_key }),
                file_size: Some(file_size),
                ..JobPatch::default()
            },
        )?;

        match self.enqueue_job(&job, None) {
            Ok(()) => Ok(job),
            // The queue's job-id dedup key makes a racing double confirm
            // observable as a duplicate, not a second work item.
            Err(SubmitError::Enqueue(QueueError::Duplicate(_))) => {
                Err(SubmitError::AlreadyConfirmed(job_id.to_string()))
            }
            Err(other) => Err(other),
        }
    }

    fn enqueue_job(&self, job: &Job, request_id: Option<String>) -> Result<(), SubmitError> {
        let item = WorkItem {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            submitter_id: job.submitter_id.clone(),
            request_id,
            attempts_made: 0,
            max_attempts: job.max_attempts,
        };
        match self.queue.enqueue(item) {
            Ok(()) => Ok(()),
            Err(QueueError::Duplicate(id)) => Err(SubmitError::Enqueue(QueueError::Duplicate(id))),
            Err(error) => {
                self.fail_admission(&job.id, ErrorCode::EnqueueFailed, &error.to_string());
                Err(SubmitError::Enqueue(error))
            }
        }
    }

    fn resolve_schema(
        &self,
        kind: JobKind,
        schema: Option<&SchemaInput>,
    ) -> Result<Option<String>, SubmitError> {
        match (kind, schema) {
            (JobKind::Parse, _) => Ok(None),
            (JobKind::Extract, None) => Err(SubmitError::Validation(
                "extract jobs require a schema".to_string(),
            )),
            (JobKind::Extract, Some(SchemaInput::Reference(id))) => {
                if self.schemas.get(id)?.is_none() {
                    return Err(SubmitError::Validation(format!(
                        "schema `{id}` is not registered"
                    )));
                }
                Ok(Some(id.clone()))
            }
            (JobKind::Extract, Some(SchemaInput::Inline(value))) => {
                let doc = SchemaDoc::from_value(value)?;
                self.schemas.put(&doc)?;
                Ok(Some(doc.id))
            }
        }
    }

    fn fail_admission(&self, job_id: &str, code: ErrorCode, message: &str) {
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            error_code: Some(Some(code)),
            error_message: Some(Some(message.to_string())),
            completed_at_ms: Some(current_timestamp_ms()),
            ..JobPatch::default()
        };
        match self.jobs.update(job_id, patch) {
            Ok(_) => {
                tracing::error!(job_id, %code, error = message, "admission failed");
                let event = JobEvent::job_failed(job_id, code, message);
                if let Err(error) = self.bus.publish(&job_channel(job_id), event) {
                    tracing::warn!(job_id, %error, "failed to publish admission failure");
                }
            }
            Err(error) => {
                tracing::error!(job_id, %error, "failed to record admission failure");
            }
        }
    }
}

fn validate_mime(mime: &str) -> Result<(), SubmitError> {
    if is_supported_mime(mime) {
        Ok(())
    } else {
        Err(SubmitError::Validation(format!(
            "unsupported mime type `{mime}`"
        )))
    }
}

fn validate_size(size: u64, limit: u64) -> Result<(), SubmitError> {
    if size > limit {
        return Err(SubmitError::Validation(format!(
            "file of {size} bytes exceeds the {limit} byte limit"
        )));
    }
    Ok(())
}

fn into_trimmed(raw: impl Into<String>) -> String {
    let raw = raw.into();
    raw.trim_end_matches('/').to_string()
}
