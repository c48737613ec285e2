use std::collections::HashMap;
use std::sync::Mutex;

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::pipeline::job::{IllegalTransition, Job, JobPatch, JobStatus};

const JOB_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

/// Errors emitted by the job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("job `{0}` already exists")]
    Duplicate(String),
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

/// Filter and page for listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobListing {
    pub jobs: Vec<Job>,
    pub total: usize,
}

/// Durable record of every job. The worker is the only writer of status
/// and result fields after admission; updates are field-scoped patches
/// applied inside a single write transaction.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    /// Read-modify-write merge of the patch; returns the updated row.
    fn update(&self, id: &str, patch: JobPatch) -> Result<Job, JobStoreError>;

    fn delete(&self, id: &str) -> Result<bool, JobStoreError>;

    fn list(&self, filter: &JobFilter, page: Page) -> Result<JobListing, JobStoreError>;
}

/// LMDB-backed persistence for jobs.
#[derive(Debug)]
pub struct LmdbJobStore {
    env: Env,
    jobs: Database<Str, Bytes>,
}

impl LmdbJobStore {
    pub fn open(paths: &AppPaths) -> Result<Self, JobStoreError> {
        let path = paths.jobs_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(JOB_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let jobs = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("jobs"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("jobs"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, jobs })
    }
}

impl JobStore for LmdbJobStore {
    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        debug_assert!(!job.id.is_empty());

        let mut wtxn = self.env.write_txn()?;
        if self.jobs.get(&wtxn, job.id.as_str())?.is_some() {
            return Err(JobStoreError::Duplicate(job.id.clone()));
        }
        let encoded = encode_to_vec(job, config::standard())?;
        self.jobs.put(&mut wtxn, job.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        debug_assert!(!id.is_empty());
        let rtxn = self.env.read_txn()?;
        let value = self.jobs.get(&rtxn, id)?;
        if let Some(raw) = value {
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    fn update(&self, id: &str, patch: JobPatch) -> Result<Job, JobStoreError> {
        debug_assert!(!id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let existing = self.jobs.get(&wtxn, id)?;
        let Some(raw) = existing else {
            return Err(JobStoreError::NotFound(id.to_string()));
        };
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
        patch.apply(&mut job)?;
        let encoded = encode_to_vec(&job, config::standard())?;
        self.jobs.put(&mut wtxn, id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(job)
    }

    fn delete(&self, id: &str) -> Result<bool, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.jobs.delete(&mut wtxn, id)?;
        wtxn.commit()?;
        Ok(removed)
    }

    fn list(&self, filter: &JobFilter, page: Page) -> Result<JobListing, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.jobs.iter(&rtxn)?;
        let mut matched = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            if job_matches(&job, filter) {
                matched.push(job);
            }
        }
        Ok(paginate(matched, page))
    }
}

fn job_matches(job: &Job, filter: &JobFilter) -> bool {
    if let Some(tenant) = filter.tenant_id.as_deref() {
        if job.tenant_id != tenant {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if job.status != status {
            return false;
        }
    }
    true
}

fn paginate(mut jobs: Vec<Job>, page: Page) -> JobListing {
    jobs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    let total = jobs.len();
    let jobs = jobs
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .collect();
    JobListing { jobs, total }
}

/// In-memory store used by tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().expect("job map lock");
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::Duplicate(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.lock().expect("job map lock");
        Ok(jobs.get(id).cloned())
    }

    fn update(&self, id: &str, patch: JobPatch) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.lock().expect("job map lock");
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        patch.apply(job)?;
        Ok(job.clone())
    }

    fn delete(&self, id: &str) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.lock().expect("job map lock");
        Ok(jobs.remove(id).is_some())
    }

    fn list(&self, filter: &JobFilter, page: Page) -> Result<JobListing, JobStoreError> {
        let jobs = self.jobs.lock().expect("job map lock");
        let matched = jobs
            .values()
            .filter(|job| job_matches(job, filter))
            .cloned()
            .collect();
        Ok(paginate(matched, page))
    }
}
