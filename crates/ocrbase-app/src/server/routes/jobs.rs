//! Job snapshot reads.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::pipeline::job::JobStatus;
use crate::server::state::AppState;
use crate::services::{JobFilter, Page};

use super::{ApiError, JobSnapshot, require_auth};

/// `GET /v1/jobs/{id}` — authoritative snapshot. Cross-tenant ids read
/// as missing.
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let auth = require_auth(&state, &headers, None)?;
    let job = state
        .jobs
        .get(&id)
        .map_err(|error| ApiError::Internal(error.to_string()))?
        .filter(|job| job.tenant_id == auth.tenant_id)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(JobSnapshot::from(&job)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    status: Option<JobStatus>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobSnapshot>,
    pub total: usize,
}

/// `GET /v1/jobs` — tenant-scoped listing for dashboards.
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<JobListResponse>, ApiError> {
    let auth = require_auth(&state, &headers, None)?;
    let filter = JobFilter {
        tenant_id: Some(auth.tenant_id),
        status: params.status,
    };
    let page = Page {
        offset: params.offset,
        limit: params.limit.unwrap_or(100).min(1000),
    };
    let listing = state
        .jobs
        .list(&filter, page)
        .map_err(|error| ApiError::Internal(error.to_string()))?;
    Ok(Json(JobListResponse {
        jobs: listing.jobs.iter().map(JobSnapshot::from).collect(),
        total: listing.total,
    }))
}
