use std::sync::Arc;
use std::time::Duration;

use crate::services::{
    BlobStore, EventBus, JobStore, SchemaStore, SubmissionService, UploadSigner, WorkQueue,
};

use super::auth::ApiKeyAuth;

/// Shared handles the HTTP surface works against. Cloning is cheap; all
/// fields are reference-counted.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub schemas: Arc<dyn SchemaStore>,
    pub queue: Arc<WorkQueue>,
    pub bus: EventBus,
    pub submission: Arc<SubmissionService>,
    pub auth: Arc<ApiKeyAuth>,
    pub signer: UploadSigner,
    pub keepalive: Duration,
    pub max_upload_bytes: u64,
}
