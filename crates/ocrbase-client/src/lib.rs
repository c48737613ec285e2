//! Client SDK for the ocrbase pipeline.
//!
//! Submission helpers plus [`Client::wait_for_completion`], which opens
//! the realtime stream, tolerates reconnects, and surfaces a single
//! terminal result. The gateway's snapshot protocol guarantees terminal
//! events are delivered even when a job finishes between reconnects.

pub mod events;
pub mod sse;

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use thiserror::Error;

use events::{CompletedData, JobSnapshot, RealtimeEvent};
use sse::SseDecoder;

const DEFAULT_STREAM_ATTEMPTS: usize = 5;
const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(250);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
    #[error("realtime stream unavailable after {attempts} attempts: {last_error}")]
    RealtimeUnavailable { attempts: usize, last_error: String },
    #[error("timed out waiting for job {0}")]
    Timeout(String),
    #[error("api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Stable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::JobFailed { .. } => "JOB_FAILED",
            ClientError::RealtimeUnavailable { .. } => "REALTIME_UNAVAILABLE",
            ClientError::Timeout(_) => "TIMEOUT",
            ClientError::Api { .. } => "API_ERROR",
            ClientError::Http(_) => "TRANSPORT",
        }
    }
}

/// Terminal result of a wait, backfilled from the job snapshot.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub markdown_result: Option<String>,
    pub json_result: Option<JsonValue>,
    pub processing_time_ms: Option<u64>,
    pub page_count: Option<u32>,
    pub llm_model: Option<String>,
    pub token_count: Option<u64>,
}

enum StreamOutcome {
    Completed(CompletedData),
    Failed { message: String },
}

enum StreamFailure {
    /// Worth reconnecting: connection loss, 5xx, stream ended early.
    Transient(String),
    /// Not worth reconnecting: auth or ownership problems.
    Fatal(ClientError),
}

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_stream_attempts: usize,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl Client {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_stream_attempts: DEFAULT_STREAM_ATTEMPTS,
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }

    /// Cap reconnect attempts of the realtime stream.
    pub fn with_max_stream_attempts(mut self, attempts: usize) -> Self {
        self.max_stream_attempts = attempts.max(1);
        self
    }

    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max.max(min);
        self
    }

    /// Submit a parse job for a remote document.
    pub async fn parse_url(&self, url: &str) -> Result<JobSnapshot, ClientError> {
        self.submit_json("/v1/parse", serde_json::json!({ "url": url }))
            .await
    }

    /// Submit a parse job for local bytes.
    pub async fn parse_file(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<JobSnapshot, ClientError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(ClientError::Http)?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/v1/parse", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// Submit an extract job for a remote document against a registered
    /// schema.
    pub async fn extract_url(
        &self,
        url: &str,
        schema_id: &str,
        hints: Option<&str>,
    ) -> Result<JobSnapshot, ClientError> {
        self.submit_json(
            "/v1/extract",
            serde_json::json!({ "url": url, "schemaId": schema_id, "hints": hints }),
        )
        .await
    }

    /// Authoritative snapshot read.
    pub async fn get_job(&self, job_id: &str) -> Result<JobSnapshot, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/jobs/{job_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// Wait for the job's terminal state over the realtime stream.
    ///
    /// Resolves on `completed`, fails with [`ClientError::JobFailed`] on a
    /// terminal `error`, reconnects with exponential backoff on transport
    /// trouble, and gives up with [`ClientError::RealtimeUnavailable`]
    /// once attempts are exhausted. The caller timeout bounds the whole
    /// wait.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<JobResult, ClientError> {
        match tokio::time::timeout(timeout, self.wait_inner(job_id)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(job_id.to_string())),
        }
    }

    async fn wait_inner(&self, job_id: &str) -> Result<JobResult, ClientError> {
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(self.backoff_min)
            .with_max_delay(self.backoff_max)
            .with_max_times(self.max_stream_attempts.saturating_sub(1))
            .build();
        let mut attempts = 0_usize;
        let mut last_error = String::new();

        loop {
            attempts += 1;
            match self.stream_once(job_id).await {
                Ok(StreamOutcome::Completed(data)) => {
                    return self.backfill(job_id, data).await;
                }
                Ok(StreamOutcome::Failed { message }) => {
                    return Err(ClientError::JobFailed {
                        job_id: job_id.to_string(),
                        message,
                    });
                }
                Err(StreamFailure::Fatal(error)) => return Err(error),
                Err(StreamFailure::Transient(reason)) => {
                    tracing::debug!(job_id, attempt = attempts, reason = %reason, "realtime stream dropped");
                    last_error = reason;
                }
            }

            match backoff.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(ClientError::RealtimeUnavailable {
                        attempts,
                        last_error,
                    });
                }
            }
        }
    }

    /// One stream attempt: connect, decode frames, return on terminal.
    async fn stream_once(&self, job_id: &str) -> Result<StreamOutcome, StreamFailure> {
        let response = self
            .http
            .get(format!("{}/v1/realtime", self.base_url))
            .query(&[("job_id", job_id)])
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|error| StreamFailure::Transient(error.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::NOT_FOUND
        {
            let message = response.text().await.unwrap_or_default();
            return Err(StreamFailure::Fatal(ClientError::Api {
                status: status.as_u16(),
                message,
            }));
        }
        if !status.is_success() {
            return Err(StreamFailure::Transient(format!(
                "realtime endpoint returned {status}"
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|error| StreamFailure::Transient(error.to_string()))?;
            for frame in decoder.feed(&chunk) {
                let event: RealtimeEvent = match serde_json::from_str(&frame.data) {
                    Ok(event) => event,
                    Err(error) => {
                        return Err(StreamFailure::Transient(format!(
                            "undecodable event: {error}"
                        )));
                    }
                };
                match event {
                    RealtimeEvent::Completed { data, .. } => {
                        return Ok(StreamOutcome::Completed(data));
                    }
                    RealtimeEvent::Error { data, .. } if data.is_job_failure() => {
                        return Ok(StreamOutcome::Failed {
                            message: data.error,
                        });
                    }
                    RealtimeEvent::Error { data, .. } => {
                        return Err(StreamFailure::Transient(data.error));
                    }
                    RealtimeEvent::Status { .. } | RealtimeEvent::Pong { .. } => {}
                }
            }
        }

        Err(StreamFailure::Transient(
            "stream closed before terminal event".to_string(),
        ))
    }

    /// One snapshot read after the terminal event to pick up fields the
    /// event does not carry.
    async fn backfill(
        &self,
        job_id: &str,
        data: CompletedData,
    ) -> Result<JobResult, ClientError> {
        let snapshot = self.get_job(job_id).await.ok();
        Ok(JobResult {
            job_id: job_id.to_string(),
            markdown_result: data
                .markdown_result
                .or_else(|| snapshot.as_ref().and_then(|s| s.markdown_result.clone())),
            json_result: data
                .json_result
                .or_else(|| snapshot.as_ref().and_then(|s| s.json_result.clone())),
            processing_time_ms: data
                .processing_time_ms
                .or_else(|| snapshot.as_ref().and_then(|s| s.processing_time_ms)),
            page_count: snapshot.as_ref().and_then(|s| s.page_count),
            llm_model: snapshot.as_ref().and_then(|s| s.llm_model.clone()),
            token_count: snapshot.as_ref().and_then(|s| s.token_count),
        })
    }

    async fn submit_json(
        &self,
        path: &str,
        body: JsonValue,
    ) -> Result<JobSnapshot, ClientError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}
