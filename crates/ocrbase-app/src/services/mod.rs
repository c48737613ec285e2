//! IO-bound pipeline services.
//!
//! Modules here coordinate external systems (stores, the queue, the OCR
//! and LLM collaborators) and the realtime fan-out. Pure transforms stay
//! in `crate::pipeline` so concurrency and resource accounting remain
//! localized.

pub mod blob_store;
pub mod event_bus;
pub mod extract;
pub mod job_store;
pub mod llm;
pub mod ocr;
pub mod queue;
pub mod schema_store;
pub mod submit;
pub mod worker;

pub use blob_store::{
    BlobError, BlobStore, FsBlobStore, MemoryBlobStore, PresignClaims, PresignError, UploadSigner,
    job_blob_key,
};
pub use event_bus::{BusError, BusRecvError, BusSubscription, EventBus};
pub use extract::{ExtractError, GeneratedSchema, StructuredExtraction, StructuredExtractor};
pub use job_store::{
    JobFilter, JobListing, JobStore, JobStoreError, LmdbJobStore, MemoryJobStore, Page,
};
pub use llm::{HttpLlmClient, LlmClient, LlmCompletion, LlmConfig, LlmError, LlmUsage};
pub use ocr::{
    HttpOcrEngine, OcrConfig, OcrEngine, OcrError, OcrOutcome, is_supported_mime,
    is_transient_status,
};
pub use queue::{
    ItemState, JobOutcome, QueueConfig, QueueError, WorkHandler, WorkItem, WorkQueue,
    calculate_retry_backoff,
};
pub use schema_store::{LmdbSchemaStore, MemorySchemaStore, SchemaStore, SchemaStoreError};
pub use submit::{
    FilePayload, PresignRequest, PresignedUpload, SchemaInput, SubmissionService, SubmitError,
    SubmitLimits, SubmitRequest,
};
pub use worker::JobWorker;
