//! Domain model of the job pipeline: the job record and its lifecycle
//! DAG, realtime event variants, and the canonical schema form.

pub mod events;
pub mod job;
pub mod schema;

pub use events::{CompletedPayload, ErrorPayload, JobEvent, StatusPayload, job_channel};
pub use job::{
    ErrorCode, IllegalTransition, Job, JobKind, JobPatch, JobSource, JobStatus, new_job_id,
    new_schema_id,
};
pub use schema::{SchemaDoc, SchemaError};
