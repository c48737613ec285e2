//! Application-level error type shared across the binary's commands.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::AppConfigError;
use crate::paths::PathError;
use crate::pipeline::schema::SchemaError;
use crate::server::ServerError;
use crate::services::{ExtractError, LlmError, SchemaStoreError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    SchemaStore(#[from] SchemaStoreError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
