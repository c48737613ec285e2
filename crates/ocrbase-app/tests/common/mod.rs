//! Shared harness: real queue and bus over in-memory stores, with
//! scripted OCR and LLM collaborators.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ocrbase_app::paths::AppPaths;
use ocrbase_app::pipeline::job::Job;
use ocrbase_app::server::auth::ApiKeyAuth;
use ocrbase_app::server::state::AppState;
use ocrbase_app::services::{
    BlobStore, EventBus, JobStore, JobWorker, LlmClient, LlmCompletion, LlmError, LlmUsage,
    MemoryBlobStore, MemoryJobStore, MemorySchemaStore, OcrEngine, OcrError, OcrOutcome,
    QueueConfig, SchemaStore, StructuredExtractor, SubmissionService, SubmitLimits, UploadSigner,
    WorkQueue,
};
use ocrbase_app::config::ApiKeyEntry;
use tempfile::TempDir;
use tokio::sync::watch;

pub const API_KEY_ORG_A: &str = "sk_test_org_a";
pub const API_KEY_ORG_B: &str = "sk_test_org_b";

/// OCR double: succeeds with fixed markdown, optionally failing the
/// first N calls with a transient error.
pub struct ScriptedOcr {
    markdown: String,
    fail_first: Mutex<u32>,
}

impl ScriptedOcr {
    pub fn ok(markdown: &str) -> Arc<Self> {
        Arc::new(Self {
            markdown: markdown.to_string(),
            fail_first: Mutex::new(0),
        })
    }

    pub fn flaky(markdown: &str, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            markdown: markdown.to_string(),
            fail_first: Mutex::new(fail_first),
        })
    }
}

#[async_trait::async_trait]
impl OcrEngine for ScriptedOcr {
    async fn parse(&self, _bytes: &[u8], _mime: &str) -> Result<OcrOutcome, OcrError> {
        let mut remaining = self.fail_first.lock().expect("fail counter");
        if *remaining > 0 {
            *remaining -= 1;
            return Err(OcrError::Http {
                status: 503,
                body: "scripted overload".to_string(),
            });
        }
        Ok(OcrOutcome {
            markdown: self.markdown.clone(),
            page_count: 1,
            token_count: Some(50),
        })
    }
}

/// LLM double replaying a fixed list of responses, repeating the last.
pub struct ScriptedLlm {
    responses: Mutex<Vec<String>>,
    last: String,
}

impl ScriptedLlm {
    pub fn always(response: &str) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
            last: response.to_string(),
        })
    }

    pub fn sequence(responses: &[&str]) -> Arc<Self> {
        let last = responses.last().map(|s| s.to_string()).unwrap_or_default();
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            last,
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system: &str, _user: &str) -> Result<LlmCompletion, LlmError> {
        let mut responses = self.responses.lock().expect("responses");
        let text = if responses.is_empty() {
            self.last.clone()
        } else {
            responses.remove(0)
        };
        Ok(LlmCompletion {
            text,
            model: "extract-test-1".to_string(),
            usage: LlmUsage { total_tokens: 11 },
        })
    }
}

pub struct Harness {
    pub _temp: TempDir,
    pub jobs: Arc<MemoryJobStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub schemas: Arc<MemorySchemaStore>,
    pub queue: Arc<WorkQueue>,
    pub bus: EventBus,
    pub submission: Arc<SubmissionService>,
    pub worker: Arc<JobWorker>,
    pub signer: UploadSigner,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Harness {
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        llm: Arc<dyn LlmClient>,
        public_base_url: &str,
    ) -> Self {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let queue_config = QueueConfig {
            concurrency: 2,
            max_attempts: 3,
            backoff_base_ms: 5,
            backoff_max_ms: 25,
            lease_ttl_ms: 10_000,
            poll_interval_ms: 10,
        };
        let queue = Arc::new(WorkQueue::open(&paths, queue_config).expect("open queue"));
        let jobs = Arc::new(MemoryJobStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let schemas = Arc::new(MemorySchemaStore::new());
        let bus = EventBus::new();
        let signer = UploadSigner::new("harness-secret");

        let submission = Arc::new(SubmissionService::new(
            Arc::clone(&jobs) as Arc<dyn JobStore>,
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
            Arc::clone(&schemas) as Arc<dyn SchemaStore>,
            Arc::clone(&queue),
            bus.clone(),
            signer.clone(),
            public_base_url,
            SubmitLimits::default(),
        ));

        let worker = Arc::new(JobWorker::new(
            Arc::clone(&jobs) as Arc<dyn JobStore>,
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
            Arc::clone(&schemas) as Arc<dyn SchemaStore>,
            ocr,
            StructuredExtractor::new(llm),
            bus.clone(),
            Duration::from_secs(5),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            _temp: temp,
            jobs,
            blobs,
            schemas,
            queue,
            bus,
            submission,
            worker,
            signer,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Run the worker pool in the background until the harness drops.
    pub fn start_queue(&self) {
        let queue = Arc::clone(&self.queue);
        let worker = Arc::clone(&self.worker);
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(queue.run(worker, shutdown));
    }

    /// Poll the job store until the job reaches a terminal state.
    pub async fn wait_terminal(&self, job_id: &str, timeout: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.jobs.get(job_id).expect("job store read") {
                if job.is_terminal() {
                    return job;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("job {job_id} did not reach a terminal state in {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn state(&self) -> AppState {
        let auth = ApiKeyAuth::new(&[
            ApiKeyEntry {
                key: API_KEY_ORG_A.to_string(),
                tenant_id: "org_a".to_string(),
                submitter_id: "user_a".to_string(),
            },
            ApiKeyEntry {
                key: API_KEY_ORG_B.to_string(),
                tenant_id: "org_b".to_string(),
                submitter_id: "user_b".to_string(),
            },
        ]);
        AppState {
            jobs: Arc::clone(&self.jobs) as Arc<dyn JobStore>,
            blobs: Arc::clone(&self.blobs) as Arc<dyn BlobStore>,
            schemas: Arc::clone(&self.schemas) as Arc<dyn SchemaStore>,
            queue: Arc::clone(&self.queue),
            bus: self.bus.clone(),
            submission: Arc::clone(&self.submission),
            auth: Arc::new(auth),
            signer: self.signer.clone(),
            keepalive: Duration::from_secs(1),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
