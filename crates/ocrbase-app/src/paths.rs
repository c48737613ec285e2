//! On-disk layout for the application data root.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

const JOBS_LMDB_DIR: &str = "jobs.mdb";
const SCHEMAS_LMDB_DIR: &str = "schemas.mdb";
const QUEUE_LMDB_DIR: &str = "queue.mdb";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("failed to create data directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves and creates the directories the stores live in.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PathError> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobs_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.subdir(JOBS_LMDB_DIR)
    }

    pub fn schemas_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.subdir(SCHEMAS_LMDB_DIR)
    }

    pub fn queue_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.subdir(QUEUE_LMDB_DIR)
    }

    pub fn blobs_dir(&self) -> Result<PathBuf, PathError> {
        self.subdir(BLOBS_DIR)
    }

    fn subdir(&self, name: &str) -> Result<PathBuf, PathError> {
        debug_assert!(!name.is_empty());
        let path = self.root.join(name);
        ensure_dir(&path)?;
        Ok(path)
    }
}

fn ensure_dir(path: &Path) -> Result<(), PathError> {
    fs::create_dir_all(path).map_err(|source| PathError::Create {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_store_directories() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("app paths");

        let jobs = paths.jobs_lmdb_dir().expect("jobs dir");
        let queue = paths.queue_lmdb_dir().expect("queue dir");
        let blobs = paths.blobs_dir().expect("blobs dir");

        assert!(jobs.exists());
        assert!(queue.exists());
        assert!(blobs.exists());
        assert!(jobs.starts_with(temp.path()));
    }
}
